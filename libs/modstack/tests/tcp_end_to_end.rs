//! Master/slave round trips over loopback TCP
//!
//! - Register, coil, file and FIFO access through a running slave
//! - Observers reacting to writes
//! - Recovery from a reply with a bad frame header
//! - Exception responses, RTU-over-TCP and unit 0 wildcard
//! - Listener shutdown

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use modstack::{
    Coil, ExceptionCode, Fifo, File, ModbusError, ModbusMaster, ModbusRequest, ModbusSlave,
    Observer, ProcessImage, RecordData, RecordRequest, Register, RegisterCell, RequestPdu,
    ResponsePdu, SlaveConfig, TransactionIdCounter,
};

fn local_config() -> SlaveConfig {
    SlaveConfig {
        bind_address: "127.0.0.1".to_string(),
        ..SlaveConfig::tcp(0)
    }
}

async fn start_slave(config: SlaveConfig, image: Arc<ProcessImage>) -> ModbusSlave {
    let slave = ModbusSlave::new(config).unwrap();
    slave.add_process_image(image);
    slave.start().await.unwrap();
    slave
}

fn master_for(slave: &ModbusSlave) -> ModbusMaster {
    let port = slave.local_addr().unwrap().port();
    let mut master = ModbusMaster::tcp("127.0.0.1", port);
    master.set_counter(Arc::new(TransactionIdCounter::new()));
    master.set_retry_delay(Duration::from_millis(10));
    master.set_timeout(Duration::from_millis(500));
    master
}

// ============================================================================
// Register access
// ============================================================================

#[tokio::test]
async fn test_read_ten_zero_registers_with_matching_transaction_id() {
    let slave = start_slave(local_config(), Arc::new(ProcessImage::with_registers(1, 10))).await;
    let master = master_for(&slave);
    master.connect().await.unwrap();

    let request = ModbusRequest::new(
        1,
        RequestPdu::ReadHoldingRegisters {
            reference: 0,
            count: 10,
        },
    );
    let response = master.execute(request).await.unwrap();
    assert_eq!(response.transaction_id(), 0);
    assert_eq!(response.unit_id(), 1);
    assert_eq!(
        response.pdu,
        ResponsePdu::ReadHoldingRegisters {
            values: vec![0; 10]
        }
    );
    assert_eq!(master.transaction().counter().current(), 1);

    let stats = slave.stats();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.exceptions, 0);

    master.disconnect().await;
    slave.stop().await;
}

#[tokio::test]
async fn test_observer_reacts_to_read_write_request() {
    let image = Arc::new(ProcessImage::with_registers(1, 10));
    let fired = Arc::new(AtomicUsize::new(0));

    // Business logic stand-in: a write to register 0 publishes {1, 4} in registers 1..2
    let observer: Observer = {
        let image = image.clone();
        let fired = fired.clone();
        Arc::new(move |register: &Register, _tag: &str| {
            fired.fetch_add(1, Ordering::SeqCst);
            if register.value() == 1 {
                image.register(1).unwrap().set_value(1);
                image.register(2).unwrap().set_value(4);
            }
        })
    };
    image.register(0).unwrap().add_observer(&observer);

    let slave = start_slave(local_config(), image.clone()).await;
    let master = master_for(&slave);

    let values = master.read_write_registers(1, 0, 10, 0, &[1]).await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(values, vec![1, 1, 4, 0, 0, 0, 0, 0, 0, 0]);

    let values = master.read_holding_registers(1, 0, 3).await.unwrap();
    assert_eq!(values, vec![1, 1, 4]);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    slave.stop().await;
}

#[tokio::test]
async fn test_writes_and_masks() {
    let image = Arc::new(ProcessImage::with_registers(7, 4));
    for _ in 0..12 {
        image.add_coil(Arc::new(Coil::new(false)));
    }
    image.add_input_register(Arc::new(Register::new(0x8001)));
    let slave = start_slave(local_config(), image.clone()).await;
    let master = master_for(&slave);

    master.write_register(7, 1, 0x1234).await.unwrap();
    master.write_registers(7, 2, &[10, 20]).await.unwrap();
    master.mask_write_register(7, 1, 0xFF00, 0x0056).await.unwrap();
    assert_eq!(
        master.read_holding_registers(7, 0, 4).await.unwrap(),
        vec![0, 0x1256, 10, 20]
    );

    assert!(master.write_coil(7, 3, true).await.unwrap());
    master
        .write_coils(7, 8, &[true, false, true, true])
        .await
        .unwrap();
    let coils = master.read_coils(7, 0, 12).await.unwrap();
    assert_eq!(coils.len(), 12);
    assert!(coils[3]);
    assert_eq!(&coils[8..], &[true, false, true, true]);

    let inputs = master.read_input_registers(7, 0, 1).await.unwrap();
    assert_eq!(inputs, vec![0x8001]);
    assert_eq!(image.input_register(0).unwrap().to_short(), -32767);

    slave.stop().await;
}

#[tokio::test]
async fn test_file_records_and_fifo() {
    let image = Arc::new(ProcessImage::new(1));
    image.add_file(Arc::new(File::new(4, 3, 5)));
    let fifo = Arc::new(Fifo::new(100));
    image.add_fifo(fifo.clone());
    let slave = start_slave(local_config(), image).await;
    let master = master_for(&slave);

    master
        .write_file_record(
            1,
            vec![RecordData {
                file_number: 4,
                record_number: 2,
                values: vec![9, 8, 7],
            }],
        )
        .await
        .unwrap();
    let records = master
        .read_file_record(
            1,
            &[RecordRequest {
                file_number: 4,
                record_number: 2,
                record_length: 4,
            }],
        )
        .await
        .unwrap();
    assert_eq!(records, vec![vec![9, 8, 7, 0]]);

    for value in 0..40u16 {
        fifo.push(value);
    }
    let queued = master.read_fifo_queue(1, 100).await.unwrap();
    assert_eq!(queued, (9..40).collect::<Vec<u16>>());

    slave.stop().await;
}

// ============================================================================
// Malformed replies
// ============================================================================

/// Answer one request per accepted connection; the first reply carries
/// protocol ID 1 and every later one is well formed
async fn serve_bad_header_once(listener: TcpListener) -> usize {
    let mut connections = 0;
    loop {
        let (mut stream, _) = listener.accept().await.unwrap();
        connections += 1;
        let mut request = [0u8; 12];
        stream.read_exact(&mut request).await.unwrap();
        let (tid_hi, tid_lo) = (request[0], request[1]);
        if connections == 1 {
            stream
                .write_all(&[tid_hi, tid_lo, 0x00, 0x01, 0x00, 0x07, 0x01, 0x03, 0x04, 0x00, 0x11, 0x00, 0x22])
                .await
                .unwrap();
            // Keep the stream open so only the master can give up on it
            let mut rest = [0u8; 1];
            let _ = stream.read(&mut rest).await;
            continue;
        }
        stream
            .write_all(&[tid_hi, tid_lo, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x00, 0x11, 0x00, 0x22])
            .await
            .unwrap();
        return connections;
    }
}

#[tokio::test]
async fn test_bad_reply_header_reconnects_and_recovers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(serve_bad_header_once(listener));

    let mut master = ModbusMaster::tcp("127.0.0.1", port);
    master.set_counter(Arc::new(TransactionIdCounter::new()));
    master.set_retry_delay(Duration::from_millis(10));
    master.set_timeout(Duration::from_millis(500));

    let values = master.read_holding_registers(1, 0, 2).await.unwrap();
    assert_eq!(values, vec![0x0011, 0x0022]);
    assert_eq!(server.await.unwrap(), 2);

    master.disconnect().await;
}

// ============================================================================
// Exceptions and unit resolution
// ============================================================================

#[tokio::test]
async fn test_exception_is_not_retried() {
    let slave = start_slave(local_config(), Arc::new(ProcessImage::with_registers(1, 10))).await;
    let master = master_for(&slave);

    let err = master.read_holding_registers(1, 5, 10).await.unwrap_err();
    assert_eq!(
        err,
        ModbusError::SlaveException {
            function_code: 0x03,
            exception: ExceptionCode::IllegalDataAddress,
        }
    );
    let err = master.read_holding_registers(9, 0, 1).await.unwrap_err();
    assert_eq!(
        err.exception_code(),
        Some(ExceptionCode::IllegalDataAddress)
    );

    let stats = slave.stats();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.exceptions, 2);

    slave.stop().await;
}

#[tokio::test]
async fn test_unit_zero_answers_any_unit() {
    let slave = start_slave(local_config(), Arc::new(ProcessImage::with_registers(0, 2))).await;
    let master = master_for(&slave);

    assert_eq!(master.read_holding_registers(17, 0, 2).await.unwrap(), vec![0, 0]);
    assert_eq!(master.read_holding_registers(200, 1, 1).await.unwrap(), vec![0]);

    slave.stop().await;
}

#[tokio::test]
async fn test_rtu_over_tcp_round_trip() {
    let config = SlaveConfig {
        rtu_over_tcp: true,
        ..local_config()
    };
    let image = Arc::new(ProcessImage::with_registers(3, 4));
    image.register(2).unwrap().set_value(0xCAFE);
    let slave = start_slave(config, image).await;

    let port = slave.local_addr().unwrap().port();
    let mut master = ModbusMaster::rtu_over_tcp("127.0.0.1", port);
    master.set_timeout(Duration::from_millis(500));

    assert_eq!(master.read_holding_registers(3, 2, 1).await.unwrap(), vec![0xCAFE]);
    master.write_register(3, 0, 77).await.unwrap();
    assert_eq!(
        master.read_holding_registers(3, 0, 4).await.unwrap(),
        vec![77, 0, 0xCAFE, 0]
    );

    slave.stop().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_master_fails_after_slave_stops() {
    let slave = start_slave(local_config(), Arc::new(ProcessImage::with_registers(1, 1))).await;
    let mut master = master_for(&slave);
    master.set_retries(2);
    assert_eq!(master.read_holding_registers(1, 0, 1).await.unwrap(), vec![0]);

    slave.stop().await;
    let err = master.read_holding_registers(1, 0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::RetriesExhausted { retries: 2, .. }));
    assert!(err.is_io());
}

#[tokio::test]
async fn test_many_connections_share_the_pool() {
    let config = SlaveConfig {
        pool_size: 2,
        ..local_config()
    };
    let slave = start_slave(config, Arc::new(ProcessImage::with_registers(1, 1))).await;
    let port = slave.local_addr().unwrap().port();

    let mut calls = Vec::new();
    for value in 0..2u16 {
        calls.push(tokio::spawn(async move {
            let master = ModbusMaster::tcp("127.0.0.1", port);
            master.write_register(1, 0, value).await.unwrap();
            master.read_holding_registers(1, 0, 1).await.unwrap();
            master.disconnect().await;
        }));
    }
    for call in calls {
        call.await.unwrap();
    }
    assert_eq!(slave.stats().accepted, 2);

    slave.stop().await;
}
