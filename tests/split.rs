use anyhow::Result;

use LitwinDB::metrics::metrics;
use LitwinDB::{DiskMap, MapConfig, MemChannel};

fn mem_map(initial_size: u32) -> Result<DiskMap> {
    DiskMap::open_new(
        Box::new(MemChannel::new()),
        Box::new(MemChannel::new()),
        initial_size,
    )
}

#[test]
fn explicit_splits_redistribute_and_keep_every_key() -> Result<()> {
    let mut map = mem_map(1)?;
    for i in 0..30 {
        map.put(
            format!("key - {}", i).as_bytes(),
            format!("value - {}", i).as_bytes(),
        )?;
    }
    assert_eq!(map.metadata().buckets_num(), 1);

    let splits_before = metrics().bucket_splits;

    // Три расщепления: 1 -> 2 бакета (конец раунда), затем 3, затем 4.
    for expected_buckets in [2u64, 3, 4] {
        map.split()?;
        assert_eq!(map.metadata().buckets_num(), expected_buckets);

        for i in 0..30 {
            assert_eq!(
                map.get(format!("key - {}", i).as_bytes())?.as_deref(),
                Some(format!("value - {}", i).as_bytes()),
                "key - {} after split to {} buckets",
                i,
                expected_buckets
            );
        }
        let report = map.check()?;
        assert_eq!(report.items, 30);
    }

    // Инвариант раунда: split_index обнулился на границе уровня.
    assert_eq!(map.metadata().split_index, 0);
    assert_eq!(map.metadata().hash_bits, 3);

    // Соседние тесты двигают глобальные счётчики, проверяем нижнюю границу.
    assert!(metrics().bucket_splits - splits_before >= 3);
    Ok(())
}

#[test]
fn splitting_an_empty_bucket_still_advances_the_round() -> Result<()> {
    let mut map = mem_map(1)?;
    map.split()?;
    assert_eq!(map.metadata().buckets_num(), 2);
    assert_eq!(map.get(b"anything")?, None);
    let report = map.check()?;
    assert_eq!(report.items, 0);
    assert_eq!(report.bucket_pages, 2);

    map.put(b"k", b"v")?;
    assert_eq!(map.get(b"k")?.as_deref(), Some(&b"v"[..]));
    map.check()?;
    Ok(())
}

#[test]
fn split_after_removals_keeps_survivors() -> Result<()> {
    let mut map = mem_map(1)?;
    for i in 0..40 {
        map.put(
            format!("key - {}", i).as_bytes(),
            format!("value - {}", i).as_bytes(),
        )?;
    }
    for i in (0..40).step_by(2) {
        map.remove(format!("key - {}", i).as_bytes())?;
    }

    map.split()?;
    map.split()?;

    for i in 0..40 {
        let got = map.get(format!("key - {}", i).as_bytes())?;
        if i % 2 == 0 {
            assert_eq!(got, None);
        } else {
            assert_eq!(got.as_deref(), Some(format!("value - {}", i).as_bytes()));
        }
    }
    let report = map.check()?;
    assert_eq!(report.items, 20);
    Ok(())
}

#[test]
fn load_factor_trigger_grows_bucket_count() -> Result<()> {
    let cfg = MapConfig::default()
        .with_initial_size(1)
        .with_split_load_factor(Some(1.0));
    let mut map = DiskMap::open_new_with(
        Box::new(MemChannel::new()),
        Box::new(MemChannel::new()),
        cfg,
    )?;

    for i in 0..120 {
        map.put(
            format!("key - {}", i).as_bytes(),
            format!("value - {}", i).as_bytes(),
        )?;
    }

    assert!(
        map.metadata().buckets_num() > 1,
        "auto-split must have fired, buckets_num = {}",
        map.metadata().buckets_num()
    );

    for i in 0..120 {
        assert_eq!(
            map.get(format!("key - {}", i).as_bytes())?.as_deref(),
            Some(format!("value - {}", i).as_bytes())
        );
    }
    let report = map.check()?;
    assert_eq!(report.items, 120);
    Ok(())
}
