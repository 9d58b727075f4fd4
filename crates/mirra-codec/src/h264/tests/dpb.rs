use mirra_core::{MirraError, MirraResult};

use super::super::{AcquireKind, DpbManager};

fn pool(count: usize) -> DpbManager<usize> {
    let mut created = Vec::new();
    DpbManager::allocate(
        count,
        &mut created,
        |created: &mut Vec<usize>, idx| -> MirraResult<usize> {
            created.push(idx);
            Ok(idx * 10)
        },
        |_, _| {},
    )
    .expect("DPB 分配失败")
}

#[test]
fn test_dpb_allocate_rolls_back_on_failure() {
    let mut live: Vec<usize> = Vec::new();
    let result = DpbManager::allocate(
        4,
        &mut live,
        |live: &mut Vec<usize>, idx| {
            if idx == 2 {
                return Err(MirraError::Gpu("显存不足".into()));
            }
            live.push(idx);
            Ok(idx)
        },
        |live: &mut Vec<usize>, resource| live.retain(|&r| r != resource),
    );
    assert!(result.is_err());
    assert!(live.is_empty(), "失败时已创建的资源应全部销毁");

    let mut unused = ();
    assert!(DpbManager::<u8>::allocate(0, &mut unused, |_, _| Ok(0), |_, _| {}).is_err());
}

#[test]
fn test_dpb_acquire_order() {
    let mut dpb = pool(3);
    assert_eq!(dpb.acquire(), (0, AcquireKind::Free));
    assert_eq!(dpb.acquire(), (1, AcquireKind::Free));
    assert_eq!(dpb.acquire(), (2, AcquireKind::Free));

    for (idx, poc) in [(0usize, 8), (1, 4), (2, 6)] {
        let slot = dpb.slot_mut(idx).unwrap();
        slot.poc = poc;
        slot.is_reference = true;
    }
    dpb.slot_mut(2).unwrap().is_reference = false;
    // 没有空闲槽位时复用第一个非参考槽位
    assert_eq!(dpb.acquire(), (2, AcquireKind::NonReference));

    dpb.slot_mut(2).unwrap().poc = 12;
    dpb.slot_mut(2).unwrap().is_reference = true;
    // 全部为参考帧时淘汰 POC 最小的槽位
    assert_eq!(dpb.acquire(), (1, AcquireKind::Evicted));
    let slot = dpb.slot(1).unwrap();
    assert!(slot.in_use);
    assert!(!slot.is_reference);
    assert_eq!(slot.poc, 0);
}

#[test]
fn test_dpb_select_leaves_slots_untouched() {
    let mut dpb = pool(2);
    for poc in [4, 2] {
        let (idx, _) = dpb.acquire();
        let slot = dpb.slot_mut(idx).unwrap();
        slot.poc = poc;
        slot.is_reference = true;
    }

    assert_eq!(dpb.select(), (1, AcquireKind::Evicted));
    assert_eq!(dpb.select(), (1, AcquireKind::Evicted), "select 不应改变结果");
    let slot = dpb.slot(1).unwrap();
    assert!(slot.is_reference);
    assert_eq!(slot.poc, 2);

    dpb.claim(1);
    let slot = dpb.slot(1).unwrap();
    assert!(slot.in_use && !slot.is_reference);
    assert_eq!(slot.poc, 0);
}

#[test]
fn test_dpb_release_keeps_metadata() {
    let mut dpb = pool(2);
    let (idx, _) = dpb.acquire();
    {
        let slot = dpb.slot_mut(idx).unwrap();
        slot.poc = 42;
        slot.frame_num = 7;
        slot.is_reference = true;
    }
    dpb.release(idx);
    let slot = dpb.slot(idx).unwrap();
    assert!(!slot.in_use);
    assert!(slot.is_reference);
    assert_eq!(slot.poc, 42);
    assert_eq!(slot.frame_num, 7);
    assert_eq!(*slot.resource(), idx * 10);
}

#[test]
fn test_dpb_find_by_poc() {
    let mut dpb = pool(4);
    for poc in [3, 9, 5] {
        let (idx, _) = dpb.acquire();
        dpb.slot_mut(idx).unwrap().poc = poc;
    }
    assert_eq!(dpb.find_by_poc(9), Some(1));
    assert_eq!(dpb.find_by_poc(5), Some(2));
    assert_eq!(dpb.find_by_poc(100), None);
    dpb.release(1);
    assert_eq!(dpb.find_by_poc(9), None, "已释放槽位不参与查找");
}

#[test]
fn test_dpb_never_double_acquires_held_slot() {
    let mut dpb = pool(4);
    let mut held: Vec<usize> = Vec::new();
    // 持有-释放交错的固定序列
    let script = [true, true, false, true, true, true, false, false, true, true, false, true];
    for (step, acquire) in script.into_iter().enumerate() {
        if acquire && held.len() < dpb.len() {
            let (idx, kind) = dpb.acquire();
            assert_eq!(kind, AcquireKind::Free, "step {} 存在空闲槽位时必须取空闲槽位", step);
            assert!(!held.contains(&idx), "step {} 槽位 {} 被重复获取", step, idx);
            held.push(idx);
        } else if let Some(idx) = held.first().copied() {
            held.remove(0);
            dpb.release(idx);
        }
        assert_eq!(dpb.in_use_count(), held.len());
    }
}

#[test]
fn test_dpb_reference_helpers() {
    let mut dpb = pool(4);
    for _ in 0..4 {
        let (idx, _) = dpb.acquire();
        dpb.slot_mut(idx).unwrap().is_reference = true;
    }
    assert_eq!(dpb.reference_indices_except(1), vec![0, 2, 3]);
    dpb.clear_references_except(1);
    assert_eq!(dpb.reference_count(), 1);
    assert!(dpb.slot(1).unwrap().is_reference);
    assert_eq!(dpb.into_resources(), vec![0, 10, 20, 30]);
}
