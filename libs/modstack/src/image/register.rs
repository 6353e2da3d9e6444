//! 16-bit registers and single-bit coils
//!
//! A register is one atomic 16-bit cell. The unsigned, signed and byte-pair
//! views are reinterpretations of the same bits. Any register can carry
//! observers; they are held weakly so dropping the observer `Arc` revokes
//! the registration.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{ModbusError, ModbusResult};

/// Tag passed to observers when a register value was written
pub const VALUE_CHANGED: &str = "value";

/// Observer callback: receives the mutated register and a change tag
pub type Observer = Arc<dyn Fn(&Register, &str) + Send + Sync>;

/// A mutable 16-bit cell
pub trait RegisterCell {
    /// Current value as unsigned 16-bit
    fn value(&self) -> u16;

    /// Store a new unsigned 16-bit value
    fn set_value(&self, value: u16);

    /// Current value reinterpreted as signed 16-bit
    fn to_short(&self) -> i16 {
        self.value() as i16
    }

    /// Current value as big-endian byte pair
    fn to_bytes(&self) -> [u8; 2] {
        self.value().to_be_bytes()
    }

    /// Store a signed 16-bit value
    fn set_short(&self, value: i16) {
        self.set_value(value as u16);
    }

    /// Store the first two bytes (big-endian) of `bytes`
    fn set_bytes(&self, bytes: &[u8]) -> ModbusResult<()> {
        match bytes {
            [hi, lo, ..] => {
                self.set_value(u16::from_be_bytes([*hi, *lo]));
                Ok(())
            },
            _ => Err(ModbusError::invalid_argument(format!(
                "register value needs 2 bytes, got {}",
                bytes.len()
            ))),
        }
    }
}

/// Holding or input register
pub struct Register {
    value: AtomicU16,
    observers: Mutex<Vec<Weak<dyn Fn(&Register, &str) + Send + Sync>>>,
}

impl Register {
    pub fn new(value: u16) -> Self {
        Self {
            value: AtomicU16::new(value),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer; the register only keeps a weak reference
    pub fn add_observer(&self, observer: &Observer) {
        self.observers.lock().push(Arc::downgrade(observer));
    }

    /// Revoke a previously added observer
    pub fn remove_observer(&self, observer: &Observer) {
        let target = Arc::downgrade(observer);
        self.observers
            .lock()
            .retain(|registered| !Weak::ptr_eq(registered, &target));
    }

    /// Number of live observer registrations
    pub fn observer_count(&self) -> usize {
        let mut observers = self.observers.lock();
        observers.retain(|registered| registered.strong_count() > 0);
        observers.len()
    }

    /// Replace the value with `f(current)` in one atomic step and notify
    /// observers once; returns the previous value
    pub fn update(&self, mut f: impl FnMut(u16) -> u16) -> u16 {
        let previous = match self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| Some(f(current)))
        {
            Ok(previous) | Err(previous) => previous,
        };
        self.notify(VALUE_CHANGED);
        previous
    }

    fn notify(&self, tag: &str) {
        // Upgrade under the lock, call outside it: observers may touch this register
        let live: Vec<Observer> = {
            let mut observers = self.observers.lock();
            observers.retain(|registered| registered.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in live {
            observer(self, tag);
        }
    }
}

impl RegisterCell for Register {
    fn value(&self) -> u16 {
        self.value.load(Ordering::Acquire)
    }

    fn set_value(&self, value: u16) {
        self.value.store(value, Ordering::Release);
        self.notify(VALUE_CHANGED);
    }
}

impl Default for Register {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Register")
            .field("value", &self.value())
            .field("observers", &self.observers.lock().len())
            .finish()
    }
}

/// Coil (read/write) or discrete input (read-only) bit
#[derive(Debug, Default)]
pub struct Coil {
    value: AtomicBool,
}

impl Coil {
    pub fn new(value: bool) -> Self {
        Self {
            value: AtomicBool::new(value),
        }
    }

    pub fn is_set(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }

    pub fn set(&self, value: bool) {
        self.value.store(value, Ordering::Release);
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_views_share_the_same_bits() {
        let register = Register::new(0);
        for value in [0u16, 1, 0x7FFF, 0x8000, 0xFFFF, 0x1234] {
            register.set_value(value);
            let bytes = register.to_bytes();
            let copy = Register::new(0);
            copy.set_bytes(&bytes).unwrap();
            assert_eq!(copy.value(), value);
            assert_eq!(copy.to_short(), value as i16);

            copy.set_short(register.to_short());
            assert_eq!(copy.value(), value);
        }
    }

    #[test]
    fn test_set_bytes_rejects_short_input() {
        let register = Register::new(7);
        let err = register.set_bytes(&[0x01]).unwrap_err();
        assert!(matches!(err, ModbusError::InvalidArgument { .. }));
        assert_eq!(register.value(), 7);
    }

    #[test]
    fn test_set_bytes_uses_first_two_bytes_big_endian() {
        let register = Register::default();
        register.set_bytes(&[0x12, 0x34, 0x56]).unwrap();
        assert_eq!(register.value(), 0x1234);
    }

    #[test]
    fn test_observers_fire_in_registration_order() {
        let register = Register::new(0);
        let order = Arc::new(Mutex::new(Vec::new()));

        let first_order = Arc::clone(&order);
        let first: Observer = Arc::new(move |_: &Register, tag: &str| {
            first_order.lock().push(("first", tag.to_string()));
        });
        let second_order = Arc::clone(&order);
        let second: Observer = Arc::new(move |_: &Register, tag: &str| {
            second_order.lock().push(("second", tag.to_string()));
        });

        register.add_observer(&first);
        register.add_observer(&second);
        register.set_value(5);

        let calls = order.lock().clone();
        assert_eq!(
            calls,
            vec![
                ("first", VALUE_CHANGED.to_string()),
                ("second", VALUE_CHANGED.to_string())
            ]
        );
    }

    #[test]
    fn test_observer_sees_new_value() {
        let register = Register::new(0);
        let seen = Arc::new(AtomicU16::new(0));
        let seen_clone = Arc::clone(&seen);
        let observer: Observer = Arc::new(move |reg: &Register, _: &str| {
            seen_clone.store(reg.value(), Ordering::SeqCst);
        });
        register.add_observer(&observer);

        register.set_short(-2);
        assert_eq!(seen.load(Ordering::SeqCst), 0xFFFE);
    }

    #[test]
    fn test_remove_and_drop_revoke_observers() {
        let register = Register::new(0);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_a = Arc::clone(&calls);
        let removed: Observer = Arc::new(move |_: &Register, _: &str| {
            calls_a.fetch_add(1, Ordering::SeqCst);
        });
        let calls_b = Arc::clone(&calls);
        let dropped: Observer = Arc::new(move |_: &Register, _: &str| {
            calls_b.fetch_add(1, Ordering::SeqCst);
        });

        register.add_observer(&removed);
        register.add_observer(&dropped);
        assert_eq!(register.observer_count(), 2);

        register.remove_observer(&removed);
        drop(dropped);
        register.set_value(1);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(register.observer_count(), 0);
    }

    #[test]
    fn test_observer_may_write_the_same_register() {
        let register = Arc::new(Register::new(0));
        let observer: Observer = Arc::new(|reg: &Register, _: &str| {
            if reg.value() == 1 {
                reg.set_value(2);
            }
        });
        register.add_observer(&observer);
        register.set_value(1);
        assert_eq!(register.value(), 2);
    }

    #[test]
    fn test_update_notifies_once() {
        let register = Register::new(0x00F2);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let observer: Observer = Arc::new(move |_: &Register, _: &str| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        register.add_observer(&observer);

        let previous = register.update(|current| (current & 0x00F2) | (0x0025 & !0x00F2));
        assert_eq!(previous, 0x00F2);
        assert_eq!(register.value(), 0x00F7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let register = Arc::new(Register::new(0));
        let workers: Vec<_> = (0..8)
            .map(|bit| {
                let register = Arc::clone(&register);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        register.update(|current| current ^ (1 << bit));
                    }
                    register.update(|current| current | (1 << bit));
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(register.value(), 0x00FF);
    }

    #[test]
    fn test_coil_set_and_clear() {
        let coil = Coil::default();
        assert!(!coil.is_set());
        coil.set(true);
        assert!(coil.is_set());
        coil.set(false);
        assert!(!coil.is_set());
    }
}
