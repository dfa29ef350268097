use crate::error::FleetError;
use crate::state::{StateManager, VmSearch};
use crate::types::{
    HistoryRecord, LcmState, NewVm, RecordFilter, ShowbackRange, ShowbackRecord, VmState,
    VmTemplate, YearMonth,
};

fn new_vm(name: &str, uid: i64) -> NewVm {
    NewVm {
        name: name.to_string(),
        uid,
        uname: format!("user{}", uid),
        gid: 100,
        gname: "users".to_string(),
        template: VmTemplate { cpu: 1.0, memory: 512, cpu_cost: 0.5, ..Default::default() },
    }
}

fn history(oid: i64, seq: i64, stime: i64, etime: i64) -> HistoryRecord {
    HistoryRecord {
        oid,
        seq,
        hostname: "node1".to_string(),
        stime,
        etime,
        cpu: 1.0,
        memory: 512,
        cpu_cost: 0.5,
        memory_cost: 0.0,
    }
}

fn showback(vmid: i64, year: i32, month: u32, cost: f64) -> ShowbackRecord {
    ShowbackRecord {
        vmid,
        vmname: format!("vm-{}", vmid),
        uid: 0,
        gid: 0,
        uname: String::new(),
        gname: String::new(),
        year,
        month,
        cost,
        hours: 1.0,
    }
}

#[tokio::test]
async fn test_state_manager_init() {
    let manager = StateManager::new_in_memory().await.unwrap();
    drop(manager);
}

#[tokio::test]
async fn test_insert_and_get_vm() {
    let manager = StateManager::new_in_memory().await.unwrap();

    let oid = manager.insert_vm(&new_vm("web", 3), VmState::Pending, 1000).await.unwrap();
    let vm = manager.get_vm(oid).await.unwrap();

    assert_eq!(vm.name, "web");
    assert_eq!(vm.uid, 3);
    assert_eq!(vm.state, VmState::Pending);
    assert_eq!(vm.lcm_state, LcmState::LcmInit);
    assert_eq!(vm.template.memory, 512);
    assert_eq!(vm.stime, 1000);
    assert!(vm.hostname.is_none());
}

#[tokio::test]
async fn test_vm_not_found() {
    let manager = StateManager::new_in_memory().await.unwrap();

    let result = manager.get_vm(42).await;
    assert!(matches!(result, Err(FleetError::VmNotFound { vm_id: 42 })));
    assert!(manager.get_vm_locked(42).await.unwrap().is_none());
}

#[tokio::test]
async fn test_locked_update_and_delete() {
    let manager = StateManager::new_in_memory().await.unwrap();
    let oid = manager.insert_vm(&new_vm("db", 1), VmState::Pending, 10).await.unwrap();

    {
        let mut vm = manager.get_vm_locked(oid).await.unwrap().unwrap();
        vm.state = VmState::Active;
        vm.lcm_state = LcmState::Running;
        vm.hostname = Some("node7".to_string());
        manager.update_vm(&vm).await.unwrap();
    }

    let vm = manager.get_vm(oid).await.unwrap();
    assert_eq!(vm.state, VmState::Active);
    assert_eq!(vm.lcm_state, LcmState::Running);
    assert_eq!(vm.hostname.as_deref(), Some("node7"));

    manager.delete_vm(oid).await.unwrap();
    assert!(manager.find_vm(oid).await.unwrap().is_none());
}

#[tokio::test]
async fn test_record_locks_do_not_outlive_records() {
    let manager = StateManager::new_in_memory().await.unwrap();
    let oid = manager.insert_vm(&new_vm("db", 1), VmState::Pending, 10).await.unwrap();

    // Missing records, as read by showback for deleted VMs
    for missing in 100..110 {
        assert!(manager.get_vm_locked(missing).await.unwrap().is_none());
    }
    assert_eq!(manager.locks.len(), 0);

    let vm = manager.get_vm_locked(oid).await.unwrap().unwrap();
    assert_eq!(manager.locks.len(), 1);
    drop(vm);

    manager.delete_vm(oid).await.unwrap();
    assert!(manager.get_vm_locked(oid).await.unwrap().is_none());
    assert_eq!(manager.locks.len(), 0);
}

#[tokio::test]
async fn test_search_running_by_last_poll() {
    let manager = StateManager::new_in_memory().await.unwrap();

    let mut oids = Vec::new();
    for (i, lcm) in [LcmState::Running, LcmState::Unknown, LcmState::Prolog].iter().enumerate() {
        let oid = manager.insert_vm(&new_vm("vm", 0), VmState::Pending, 0).await.unwrap();
        let mut vm = manager.get_vm(oid).await.unwrap();
        vm.state = VmState::Active;
        vm.lcm_state = *lcm;
        vm.last_poll = 100 - i as i64;
        manager.update_vm(&vm).await.unwrap();
        oids.push(oid);
    }

    let search = VmSearch {
        states: vec![VmState::Active],
        lcm_states: vec![LcmState::Running, LcmState::Unknown],
        polled_before: Some(100),
        order_by_last_poll: true,
        limit: Some(10),
        ..Default::default()
    };
    let found = manager.search_vms(&search).await.unwrap();

    // Oldest poll first, PROLOG excluded
    assert_eq!(found, vec![oids[1], oids[0]]);

    let limited = manager.search_vms(&VmSearch { limit: Some(1), ..search }).await.unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn test_history_open_and_close() {
    let manager = StateManager::new_in_memory().await.unwrap();
    let oid = manager.insert_vm(&new_vm("vm", 0), VmState::Pending, 0).await.unwrap();

    assert_eq!(manager.next_history_seq(oid).await.unwrap(), 0);
    manager.insert_history(&history(oid, 0, 100, 0)).await.unwrap();
    assert_eq!(manager.next_history_seq(oid).await.unwrap(), 1);

    let closed = manager.close_history(oid, 500).await.unwrap();
    assert_eq!(closed.etime, 500);

    let result = manager.close_history(oid, 600).await;
    assert!(matches!(result, Err(FleetError::NoOpenHistory { .. })));
}

#[tokio::test]
async fn test_dump_history_window() {
    let manager = StateManager::new_in_memory().await.unwrap();
    let oid = manager.insert_vm(&new_vm("vm", 0), VmState::Pending, 0).await.unwrap();

    manager.insert_history(&history(oid, 0, 100, 200)).await.unwrap();
    manager.insert_history(&history(oid, 1, 300, 400)).await.unwrap();
    manager.insert_history(&history(oid, 2, 500, 0)).await.unwrap();

    let doc = manager.dump_history(RecordFilter::default(), Some(250), Some(1000)).await.unwrap();
    let records = doc["HISTORY_RECORDS"].as_array().unwrap();
    let seqs: Vec<i64> = records.iter().map(|r| r["SEQ"].as_i64().unwrap()).collect();
    assert_eq!(seqs, vec![1, 2]);

    assert_eq!(manager.min_history_stime().await.unwrap(), Some(100));

    // History survives the VM record
    manager.delete_vm(oid).await.unwrap();
    let doc = manager.dump_history(RecordFilter::vm(oid), None, None).await.unwrap();
    assert_eq!(doc["HISTORY_RECORDS"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_min_stime_without_history() {
    let manager = StateManager::new_in_memory().await.unwrap();
    assert_eq!(manager.min_history_stime().await.unwrap(), None);
}

#[tokio::test]
async fn test_monitoring_expiration() {
    let manager = StateManager::new_in_memory().await.unwrap();
    let oid = manager.insert_vm(&new_vm("vm", 0), VmState::Pending, 0).await.unwrap();

    for poll in [100, 200, 300] {
        manager.insert_monitoring(oid, poll, &serde_json::json!({ "CPU": poll })).await.unwrap();
    }
    assert_eq!(manager.get_vm(oid).await.unwrap().last_poll, 300);

    assert_eq!(manager.delete_monitoring_before(250).await.unwrap(), 2);
    let doc = manager.dump_monitoring(RecordFilter::vm(oid)).await.unwrap();
    assert_eq!(doc["MONITORING_DATA"].as_array().unwrap().len(), 1);

    assert_eq!(manager.delete_all_monitoring().await.unwrap(), 1);
}

#[tokio::test]
async fn test_upsert_showback_replaces() {
    let manager = StateManager::new_in_memory().await.unwrap();

    let first_run = [showback(1, 2024, 1, 10.0), showback(1, 2024, 2, 20.0)];
    manager.upsert_showback(&first_run).await.unwrap();
    manager.upsert_showback(&[showback(1, 2024, 1, 12.5)]).await.unwrap();

    let doc =
        manager.dump_showback(RecordFilter::default(), ShowbackRange::default()).await.unwrap();
    let rows = doc["SHOWBACK_RECORDS"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["COST"].as_f64(), Some(12.5));
    assert_eq!(rows[1]["MONTH"].as_i64(), Some(2));

    let range = ShowbackRange::new(Some(YearMonth::new(2024, 2)), None);
    let doc = manager.dump_showback(RecordFilter::default(), range).await.unwrap();
    assert_eq!(doc["SHOWBACK_RECORDS"].as_array().unwrap().len(), 1);

    assert_eq!(manager.upsert_showback(&[]).await.unwrap(), 0);
}
