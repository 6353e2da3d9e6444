//! Transaction engine
//!
//! Executes one request against a [`MasterConnection`] with connect-on-demand,
//! retry with randomized backoff, reconnect after I/O failures and
//! transaction-ID validity checking.
//!
//! Per call:
//! 1. Connect if needed (a failed connect uses up an attempt).
//! 2. Stamp the request with the current transaction ID, apply the
//!    connection timeout, write the request and read one response.
//! 3. An exception response fails immediately.
//! 4. A response is valid unless it is missing or, on a non-headless
//!    connection with checking enabled, carries another transaction ID.
//! 5. Invalid: back off `base/2 + rand * base * attempt`, reconnecting first
//!    after an I/O failure, until the retry budget is spent.
//! 6. Valid: advance the transaction ID when checking is enabled.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::connection::MasterConnection;
use crate::constants::{
    function_code_description, DEFAULT_RETRIES, DEFAULT_RETRY_SLEEP_MS, MAX_TRANSACTION_ID,
};
use crate::error::{ModbusError, ModbusResult};
use crate::message::{ModbusRequest, ModbusResponse};
use crate::pdu::ResponsePdu;

/// Transaction-ID counter, wrapping to 0 after 32767
#[derive(Debug, Default)]
pub struct TransactionIdCounter {
    next: Mutex<u16>,
}

impl TransactionIdCounter {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(value: u16) -> Self {
        Self {
            next: Mutex::new(value.min(MAX_TRANSACTION_ID)),
        }
    }

    /// Counter shared by every master in the process
    pub fn global() -> Arc<TransactionIdCounter> {
        static GLOBAL: OnceLock<Arc<TransactionIdCounter>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(TransactionIdCounter::new())))
    }

    /// ID the next request will carry
    pub fn current(&self) -> u16 {
        *self.next.lock()
    }

    /// Move to the next ID and return it
    pub fn advance(&self) -> u16 {
        let mut next = self.next.lock();
        *next = if *next >= MAX_TRANSACTION_ID { 0 } else { *next + 1 };
        *next
    }
}

/// Retry and validity settings of a master
#[derive(Debug, Clone)]
pub struct Transaction {
    counter: Arc<TransactionIdCounter>,
    retries: u32,
    retry_delay: Duration,
    check_validity: bool,
    reconnecting: bool,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new(TransactionIdCounter::global())
    }
}

impl Transaction {
    pub fn new(counter: Arc<TransactionIdCounter>) -> Self {
        Self {
            counter,
            retries: DEFAULT_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_SLEEP_MS),
            check_validity: true,
            reconnecting: false,
        }
    }

    pub fn counter(&self) -> &Arc<TransactionIdCounter> {
        &self.counter
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Attempts per execute, at least 1
    pub fn set_retries(&mut self, retries: u32) {
        self.retries = retries.max(1);
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn set_retry_delay(&mut self, retry_delay: Duration) {
        self.retry_delay = retry_delay;
    }

    pub fn check_validity(&self) -> bool {
        self.check_validity
    }

    pub fn set_check_validity(&mut self, check_validity: bool) {
        self.check_validity = check_validity;
    }

    pub fn reconnecting(&self) -> bool {
        self.reconnecting
    }

    /// Close the connection after every execute
    pub fn set_reconnecting(&mut self, reconnecting: bool) {
        self.reconnecting = reconnecting;
    }

    /// Randomized backoff before retry number `retry_count`
    fn backoff(&self, retry_count: u32) -> Duration {
        let base = self.retry_delay.as_secs_f64();
        let jitter: f64 = rand::thread_rng().gen();
        Duration::from_secs_f64(base / 2.0 + jitter * base * f64::from(retry_count))
    }

    fn is_valid(&self, connection: &dyn MasterConnection, request: &ModbusRequest, response: &ModbusResponse) -> bool {
        connection.is_headless()
            || !self.check_validity
            || request.transaction_id() == response.transaction_id()
    }

    async fn attempt(
        &self,
        connection: &mut dyn MasterConnection,
        request: &ModbusRequest,
    ) -> ModbusResult<ModbusResponse> {
        if !connection.is_connected() {
            connection.connect().await?;
        }
        // The connection sets its timeout on the transport before writing
        connection.exchange(request).await
    }

    /// Execute `request` on `connection`
    ///
    /// The request's transaction ID is overwritten with the counter value on
    /// every attempt.
    pub async fn execute(
        &self,
        connection: &mut dyn MasterConnection,
        request: &mut ModbusRequest,
    ) -> ModbusResult<ModbusResponse> {
        let result = self.run(connection, request).await;
        if self.reconnecting {
            connection.close().await;
        }
        result
    }

    async fn run(
        &self,
        connection: &mut dyn MasterConnection,
        request: &mut ModbusRequest,
    ) -> ModbusResult<ModbusResponse> {
        let function_code = request.function_code();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            request.set_transaction_id(self.counter.current());
            debug!(
                "Executing FC={:02X} ({}) unit={} tid={} on {} (attempt {}/{})",
                function_code,
                function_code_description(function_code),
                request.unit_id(),
                request.transaction_id(),
                connection.describe(),
                attempt,
                self.retries
            );

            let last_error = match self.attempt(connection, request).await {
                Ok(response) => {
                    if let ResponsePdu::Exception {
                        function_code,
                        exception,
                    } = &response.pdu
                    {
                        return Err(ModbusError::slave_exception(*function_code, *exception));
                    }
                    if self.is_valid(connection, request, &response) {
                        if self.check_validity {
                            self.counter.advance();
                        }
                        return Ok(response);
                    }
                    ModbusError::protocol(format!(
                        "response transaction ID {} does not match request {}",
                        response.transaction_id(),
                        request.transaction_id()
                    ))
                },
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if e.needs_reconnect() {
                        connection.close().await;
                    }
                    e
                },
            };

            if attempt >= self.retries {
                return Err(ModbusError::RetriesExhausted {
                    retries: attempt,
                    last_error: Box::new(last_error),
                });
            }

            let delay = self.backoff(attempt);
            warn!(
                "Transaction on {} failed (attempt {}/{}): {}; retrying in {:?}",
                connection.describe(),
                attempt,
                self.retries,
                last_error,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::error::ExceptionCode;
    use crate::message::MessageHeader;
    use crate::pdu::RequestPdu;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tracing_test::traced_test;

    /// What the scripted connection does on one exchange
    enum Step {
        Fail(ModbusError),
        Echo,
        Tid(u16),
        Exception(ExceptionCode),
    }

    #[derive(Default)]
    struct Scripted {
        steps: VecDeque<Step>,
        headless: bool,
        connected: bool,
        fail_connects: u32,
        connects: u32,
        closes: u32,
        seen_tids: Vec<u16>,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl MasterConnection for Scripted {
        async fn connect(&mut self) -> ModbusResult<()> {
            self.connects += 1;
            if self.fail_connects > 0 {
                self.fail_connects -= 1;
                return Err(ModbusError::io("connection refused"));
            }
            self.connected = true;
            Ok(())
        }

        async fn close(&mut self) {
            self.closes += 1;
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn is_headless(&self) -> bool {
            self.headless
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(10)
        }

        fn set_timeout(&mut self, _timeout: Duration) {}

        async fn exchange(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
            self.seen_tids.push(request.transaction_id());
            let ok = |tid| {
                ModbusResponse::new(
                    MessageHeader::new(tid, request.unit_id()),
                    ResponsePdu::ReadHoldingRegisters { values: vec![0; 2] },
                )
            };
            match self.steps.pop_front().unwrap_or(Step::Echo) {
                Step::Fail(e) => Err(e),
                Step::Echo => Ok(ok(request.transaction_id())),
                Step::Tid(tid) => Ok(ok(tid)),
                Step::Exception(exception) => Ok(ModbusResponse::new(
                    request.header,
                    ResponsePdu::exception(request.function_code(), exception),
                )),
            }
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    fn engine(counter: u16) -> Transaction {
        let mut transaction = Transaction::new(Arc::new(TransactionIdCounter::starting_at(counter)));
        transaction.set_retry_delay(Duration::from_millis(1));
        transaction
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

    #[test]
    fn test_counter_wraps_after_max() {
        let counter = TransactionIdCounter::starting_at(MAX_TRANSACTION_ID - 1);
        assert_eq!(counter.advance(), MAX_TRANSACTION_ID);
        assert_eq!(counter.advance(), 0);
        assert_eq!(counter.current(), 0);
    }

    #[test]
    fn test_global_counter_is_shared() {
        assert!(Arc::ptr_eq(
            &TransactionIdCounter::global(),
            &TransactionIdCounter::global()
        ));
    }

    #[tokio::test]
    async fn test_successful_executes_advance_counter() {
        let transaction = engine(0);
        let mut connection = Scripted::new(vec![]);
        for expected in 0..5u16 {
            let mut request = read_request();
            let response = transaction.execute(&mut connection, &mut request).await.unwrap();
            assert_eq!(response.transaction_id(), expected);
        }
        assert_eq!(transaction.counter().current(), 5);
        assert_eq!(connection.connects, 1);
    }

    #[tokio::test]
    async fn test_io_failures_then_success_advance_once() {
        let transaction = engine(10);
        let mut connection = Scripted::new(vec![
            Step::Fail(ModbusError::io("reset")),
            Step::Fail(ModbusError::timeout("slow")),
        ]);
        let mut request = read_request();
        let response = transaction.execute(&mut connection, &mut request).await.unwrap();

        assert_eq!(response.transaction_id(), 10);
        assert_eq!(connection.seen_tids, vec![10, 10, 10]);
        assert_eq!(transaction.counter().current(), 11);
        // Reconnected after each I/O failure
        assert_eq!(connection.connects, 3);
        assert_eq!(connection.closes, 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted_reports_count() {
        let mut transaction = engine(0);
        transaction.set_retries(3);
        let mut connection = Scripted::new(
            (0..3).map(|_| Step::Fail(ModbusError::io("down"))).collect(),
        );
        let mut request = read_request();
        let err = transaction.execute(&mut connection, &mut request).await.unwrap_err();

        match &err {
            ModbusError::RetriesExhausted { retries, .. } => assert_eq!(*retries, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert!(err.is_io());
        assert!(err.to_string().contains("tried 3 times"));
        assert_eq!(transaction.counter().current(), 0);
    }

    #[tokio::test]
    async fn test_connect_failures_count_toward_budget() {
        let mut transaction = engine(0);
        transaction.set_retries(2);
        let mut connection = Scripted::new(vec![]);
        connection.fail_connects = 5;
        let mut request = read_request();
        assert!(matches!(
            transaction.execute(&mut connection, &mut request).await.unwrap_err(),
            ModbusError::RetriesExhausted { retries: 2, .. }
        ));
        assert_eq!(connection.connects, 2);
    }

    #[tokio::test]
    async fn test_mismatched_tid_is_retried_when_checking() {
        let transaction = engine(3);
        let mut connection = Scripted::new(vec![Step::Tid(99)]);
        let mut request = read_request();
        let response = transaction.execute(&mut connection, &mut request).await.unwrap();
        assert_eq!(response.transaction_id(), 3);
        assert_eq!(connection.seen_tids.len(), 2);
        // No reconnect for a well-formed but foreign response
        assert_eq!(connection.closes, 0);
    }

    #[tokio::test]
    async fn test_mismatched_tid_accepted_without_checking() {
        let mut transaction = engine(3);
        transaction.set_check_validity(false);
        let mut connection = Scripted::new(vec![Step::Tid(99)]);
        let mut request = read_request();
        let response = transaction.execute(&mut connection, &mut request).await.unwrap();
        assert_eq!(response.transaction_id(), 99);
        assert_eq!(connection.seen_tids.len(), 1);
        assert_eq!(transaction.counter().current(), 3);
    }

    #[tokio::test]
    async fn test_headless_skips_tid_check() {
        let transaction = engine(3);
        let mut connection = Scripted::new(vec![Step::Tid(0)]);
        connection.headless = true;
        let mut request = read_request();
        transaction.execute(&mut connection, &mut request).await.unwrap();
        assert_eq!(connection.seen_tids.len(), 1);
        assert_eq!(transaction.counter().current(), 4);
    }

    #[tokio::test]
    async fn test_exception_is_not_retried() {
        let transaction = engine(0);
        let mut connection = Scripted::new(vec![Step::Exception(ExceptionCode::IllegalDataAddress)]);
        let mut request = read_request();
        let err = transaction.execute(&mut connection, &mut request).await.unwrap_err();
        assert_eq!(
            err,
            ModbusError::SlaveException {
                function_code: 0x03,
                exception: ExceptionCode::IllegalDataAddress
            }
        );
        assert_eq!(connection.seen_tids.len(), 1);
        assert_eq!(transaction.counter().current(), 0);
    }

    #[tokio::test]
    async fn test_reconnecting_mode_closes_after_each_execute() {
        let mut transaction = engine(0);
        transaction.set_reconnecting(true);
        let mut connection = Scripted::new(vec![]);
        for _ in 0..3 {
            let mut request = read_request();
            transaction.execute(&mut connection, &mut request).await.unwrap();
            assert!(!connection.is_connected());
        }
        assert_eq!(connection.connects, 3);
        assert_eq!(connection.closes, 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_retry_is_logged_with_cause() {
        let transaction = engine(3);
        let mut connection = Scripted::new(vec![Step::Tid(99)]);
        let mut request = read_request();
        transaction.execute(&mut connection, &mut request).await.unwrap();
        assert!(logs_contain("attempt 1/5"));
        assert!(logs_contain("does not match request 3"));
    }

    #[test]
    fn test_backoff_bounds() {
        let mut transaction = engine(0);
        transaction.set_retry_delay(Duration::from_millis(500));
        for retry in 1..4u32 {
            let delay = transaction.backoff(retry);
            assert!(delay >= Duration::from_millis(250));
            assert!(delay <= Duration::from_millis(250 + 500 * u64::from(retry)));
        }
    }
}
