use anyhow::Result;

use LitwinDB::{FreeSpaceMap, MemChannel};

fn mem_fsm() -> Result<FreeSpaceMap> {
    FreeSpaceMap::new(Box::new(MemChannel::new()))
}

#[test]
fn sixteen_takes_then_freed_slots_in_order() -> Result<()> {
    let mut fsm = mem_fsm()?;

    for expected in 0..16 {
        assert_eq!(fsm.take_free_page()?, expected);
    }

    fsm.free(1)?;
    fsm.free(5)?;
    fsm.free(9)?;

    // First-fit: освобождённые слоты возвращаются строго по возрастанию.
    assert_eq!(fsm.take_free_page()?, 1);
    assert_eq!(fsm.take_free_page()?, 5);
    assert_eq!(fsm.take_free_page()?, 9);
    Ok(())
}

#[test]
fn distant_take_allocates_intermediate_pages_lazily() -> Result<()> {
    let mut fsm = mem_fsm()?;
    for _ in 0..16 {
        fsm.take_free_page()?;
    }

    fsm.take(20_000)?;
    assert!(!fsm.is_free(20_000)?);

    // Промежуточные страницы нулевые, поиск всё ещё находит слот 16.
    assert!(fsm.is_free(16)?);
    assert_eq!(fsm.find_free_page()?, 16);
    assert_eq!(fsm.take_free_page()?, 16);
    Ok(())
}

#[test]
fn full_fsm_page_is_skipped_bytewise() -> Result<()> {
    let mut fsm = mem_fsm()?;
    // Занимаем первую FSM-страницу целиком (256 слотов).
    for _ in 0..256 {
        fsm.take_free_page()?;
    }
    // Следующий слот приходит с второй страницы.
    assert_eq!(fsm.find_free_page()?, 256);
    assert_eq!(fsm.take_free_page()?, 256);

    // Дырка в середине первой страницы находится раньше хвоста.
    fsm.free(130)?;
    assert_eq!(fsm.take_free_page()?, 130);
    Ok(())
}
