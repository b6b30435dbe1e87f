use anyhow::Result;
use oorandom::Rand64;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use LitwinDB::metrics::{metrics, reset_metrics};
use LitwinDB::{DiskMap, FileChannel, MapConfig};

#[test]
fn churn_put_overwrite_remove_against_model() -> Result<()> {
    // Единственный тест в бинаре, глобальные счётчики можно сбросить и
    // проверять абсолютно.
    reset_metrics();

    let root = unique_root("churn");
    fs::create_dir_all(&root)?;

    let cfg = MapConfig::default()
        .with_initial_size(4)
        .with_split_load_factor(Some(4.0));
    let data = FileChannel::open(&root.join("kv_data"))?;
    let fsm = FileChannel::open(&root.join("kv_fsm"))?;
    let mut map = DiskMap::open_new_with(Box::new(data), Box::new(fsm), cfg)?;

    // Модель истинного состояния.
    let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();

    // Детерминированный генератор.
    let mut rng = Rand64::new(0xA1B2_C3D4_E5F6_7788);

    let total_keys = 400usize;
    let mut keys: Vec<Vec<u8>> = Vec::with_capacity(total_keys);
    for i in 0..total_keys {
        keys.push(format!("k-{:016x}-{:04}", rng.rand_u64(), i).into_bytes());
    }

    for op in 0..4000 {
        let key = &keys[(rng.rand_u64() as usize) % total_keys];
        match rng.rand_u64() % 4 {
            // put и overwrite: значения переменной длины, включая пустые
            0 | 1 | 2 => {
                let len = (rng.rand_u64() % 80) as usize;
                let fill = (rng.rand_u64() & 0xFF) as u8;
                let value = vec![fill; len];
                map.put(key, &value)?;
                model.insert(key.clone(), value);
            }
            _ => {
                map.remove(key)?;
                model.remove(key);
            }
        }

        if op % 500 == 499 {
            map.check()?;
        }
    }

    // Полная сверка с моделью.
    for key in &keys {
        assert_eq!(map.get(key)?, model.get(key).cloned(), "key {:?}", key);
    }
    let report = map.check()?;
    assert_eq!(report.items, model.len() as u64);
    assert!(
        map.metadata().buckets_num() > 4,
        "churn volume must have triggered splits"
    );

    let m = metrics();
    assert!(m.pages_read > 0);
    assert!(m.pages_written > 0);
    assert!(m.overflow_allocated > 0, "chains must have overflowed");
    assert!(m.bucket_splits > 0, "auto-split must have been recorded");
    map.close();

    // Перечитываем с диска и сверяем ещё раз.
    let mut map = DiskMap::open_at(&root, "kv")?;
    for key in &keys {
        assert_eq!(map.get(key)?, model.get(key).cloned());
    }
    map.check()?;
    Ok(())
}

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("lwdb-{}-{}-{}", prefix, pid, t))
}
