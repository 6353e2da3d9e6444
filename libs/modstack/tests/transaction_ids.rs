//! Transaction ID sequencing against a live slave

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;

use modstack::constants::MAX_TRANSACTION_ID;
use modstack::{
    ModbusMaster, ModbusRequest, ModbusSlave, ProcessImage, RequestPdu, SlaveConfig,
    TransactionIdCounter,
};

async fn start_slave() -> ModbusSlave {
    let slave = ModbusSlave::new(SlaveConfig {
        bind_address: "127.0.0.1".to_string(),
        ..SlaveConfig::tcp(0)
    })
    .unwrap();
    slave.add_process_image(Arc::new(ProcessImage::with_registers(1, 2)));
    slave.start().await.unwrap();
    slave
}

fn read_request() -> ModbusRequest {
    ModbusRequest::new(
        1,
        RequestPdu::ReadHoldingRegisters {
            reference: 0,
            count: 2,
        },
    )
}

#[tokio::test]
async fn test_counter_advances_once_per_successful_execute() {
    let slave = start_slave().await;
    let port = slave.local_addr().unwrap().port();
    let mut master = ModbusMaster::tcp("127.0.0.1", port);
    master.set_counter(Arc::new(TransactionIdCounter::new()));

    for expected in 0..5u16 {
        let response = master.execute(read_request()).await.unwrap();
        assert_eq!(response.transaction_id(), expected);
    }
    assert_eq!(master.transaction().counter().current(), 5);

    slave.stop().await;
}

#[tokio::test]
async fn test_counter_wraps_after_maximum() {
    let slave = start_slave().await;
    let port = slave.local_addr().unwrap().port();
    let mut master = ModbusMaster::tcp("127.0.0.1", port);
    master.set_counter(Arc::new(TransactionIdCounter::starting_at(MAX_TRANSACTION_ID)));

    let response = master.execute(read_request()).await.unwrap();
    assert_eq!(response.transaction_id(), MAX_TRANSACTION_ID);
    let response = master.execute(read_request()).await.unwrap();
    assert_eq!(response.transaction_id(), 0);

    slave.stop().await;
}

#[tokio::test]
async fn test_counter_frozen_without_validity_check() {
    let slave = start_slave().await;
    let port = slave.local_addr().unwrap().port();
    let mut master = ModbusMaster::tcp("127.0.0.1", port);
    master.set_counter(Arc::new(TransactionIdCounter::starting_at(42)));
    master.set_check_validity(false);

    for _ in 0..3 {
        let response = master.execute(read_request()).await.unwrap();
        assert_eq!(response.transaction_id(), 42);
    }

    slave.stop().await;
}

#[tokio::test]
async fn test_masters_sharing_a_counter_interleave_ids() {
    let slave = start_slave().await;
    let port = slave.local_addr().unwrap().port();
    let counter = Arc::new(TransactionIdCounter::new());

    let mut first = ModbusMaster::tcp("127.0.0.1", port);
    first.set_counter(counter.clone());
    let mut second = ModbusMaster::tcp("127.0.0.1", port);
    second.set_counter(counter.clone());

    assert_eq!(first.execute(read_request()).await.unwrap().transaction_id(), 0);
    assert_eq!(second.execute(read_request()).await.unwrap().transaction_id(), 1);
    assert_eq!(first.execute(read_request()).await.unwrap().transaction_id(), 2);
    assert_eq!(counter.current(), 3);

    slave.stop().await;
}

#[tokio::test]
async fn test_reconnecting_master_opens_connection_per_transaction() {
    let slave = start_slave().await;
    let port = slave.local_addr().unwrap().port();
    let mut master = ModbusMaster::tcp("127.0.0.1", port);
    master.set_reconnecting(true);

    for _ in 0..3 {
        master.execute(read_request()).await.unwrap();
        assert!(!master.is_connected().await);
    }
    assert_eq!(slave.stats().accepted, 3);

    slave.stop().await;
}
