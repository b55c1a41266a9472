//! Live extension instances and point-to-point message routing.
//!
//! The router never lets a recipient's failure escape: returned errors and
//! panics are both caught, logged as `sender -> recipient` and handed back as
//! a [`RouteOutcome`] for the caller to record.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::capability::ExtensionKind;
use crate::error::{BridgeError, BridgeResult};

const ID_PATTERN: &str = r"^[A-Za-z0-9_\-~.]+$";

fn id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ID_PATTERN).expect("id pattern is a valid regex"))
}

pub fn validate_id(what: &'static str, id: &str) -> BridgeResult<()> {
    if id_regex().is_match(id) {
        Ok(())
    } else {
        Err(BridgeError::InvalidId {
            what,
            id: id.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: String,
    pub extension_id: String,
    pub kind: ExtensionKind,
    /// Times this instance's code has been (re)started.
    pub run_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutedMessage {
    pub sender: String,
    pub target: String,
    pub payload: Value,
}

/// Delivery entry point of a bound instance.
pub type SendFn = Rc<dyn Fn(&RoutedMessage) -> BridgeResult<()>>;

#[derive(Debug)]
pub enum RouteOutcome {
    Delivered,
    /// Target not bound; the message went nowhere.
    Dropped,
    Failed(BridgeError),
}

#[derive(Default)]
pub struct InstanceRegistry {
    records: HashMap<String, InstanceRecord>,
    order: Vec<String>,
    senders: HashMap<String, SendFn>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: &str,
        extension_id: &str,
        kind: ExtensionKind,
    ) -> BridgeResult<()> {
        validate_id("instance", id)?;
        validate_id("extension", extension_id)?;
        if self.records.contains_key(id) {
            return Err(BridgeError::DuplicateInstance(id.to_string()));
        }
        self.records.insert(
            id.to_string(),
            InstanceRecord {
                id: id.to_string(),
                extension_id: extension_id.to_string(),
                kind,
                run_count: 0,
            },
        );
        self.order.push(id.to_string());
        log::debug!("Registered instance {id} ({extension_id}, {kind})");
        Ok(())
    }

    /// Remove the record and its sender binding.
    pub fn unregister(&mut self, id: &str) -> Option<InstanceRecord> {
        self.senders.remove(id);
        self.order.retain(|o| o != id);
        self.records.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&InstanceRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Instance ids in registration order.
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    pub fn records(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    pub fn bind_sender(&mut self, id: &str, send: SendFn) -> BridgeResult<()> {
        if !self.records.contains_key(id) {
            return Err(BridgeError::UnknownInstance(id.to_string()));
        }
        self.senders.insert(id.to_string(), send);
        Ok(())
    }

    pub fn unbind_sender(&mut self, id: &str) -> bool {
        self.senders.remove(id).is_some()
    }

    pub fn is_bound(&self, id: &str) -> bool {
        self.senders.contains_key(id)
    }

    /// Deliver `payload` from `sender` to `target`.
    pub fn route(&self, target: &str, payload: Value, sender: &str) -> RouteOutcome {
        let Some(send) = self.senders.get(target).cloned() else {
            log::debug!("Dropping message {sender} -> {target}: target not bound");
            return RouteOutcome::Dropped;
        };
        let message = RoutedMessage {
            sender: sender.to_string(),
            target: target.to_string(),
            payload,
        };
        match catch_unwind(AssertUnwindSafe(|| send(&message))) {
            Ok(Ok(())) => RouteOutcome::Delivered,
            Ok(Err(err)) => {
                log::warn!("Message {sender} -> {target} failed: {err}");
                RouteOutcome::Failed(BridgeError::RecipientFailure {
                    sender: sender.to_string(),
                    recipient: target.to_string(),
                    message: err.to_string(),
                })
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                log::error!("Message {sender} -> {target} panicked: {reason}");
                RouteOutcome::Failed(BridgeError::RecipientFailure {
                    sender: sender.to_string(),
                    recipient: target.to_string(),
                    message: reason,
                })
            }
        }
    }

    pub fn increment(&mut self, id: &str) -> Option<u32> {
        let record = self.records.get_mut(id)?;
        record.run_count = record.run_count.saturating_add(1);
        Some(record.run_count)
    }

    pub fn decrement(&mut self, id: &str) -> Option<u32> {
        let record = self.records.get_mut(id)?;
        record.run_count = record.run_count.saturating_sub(1);
        Some(record.run_count)
    }

    pub fn clear(&mut self, id: &str) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.run_count = 0;
                true
            }
            None => false,
        }
    }

    pub fn clear_all(&mut self) {
        for record in self.records.values_mut() {
            record.run_count = 0;
        }
    }

    pub fn run_count(&self, id: &str) -> Option<u32> {
        self.records.get(id).map(|r| r.run_count)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    fn recorder() -> (SendFn, Rc<RefCell<Vec<RoutedMessage>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let send: SendFn = Rc::new(move |m: &RoutedMessage| {
            sink.borrow_mut().push(m.clone());
            Ok(())
        });
        (send, seen)
    }

    #[test]
    fn test_ids_are_validated() {
        let mut reg = InstanceRegistry::new();
        assert!(reg.register("w-1.a~b_c", "ext", ExtensionKind::Widget).is_ok());
        assert!(matches!(
            reg.register("bad id", "ext", ExtensionKind::Widget),
            Err(BridgeError::InvalidId { what: "instance", .. })
        ));
        assert!(matches!(
            reg.register("ok", "", ExtensionKind::Block),
            Err(BridgeError::InvalidId { what: "extension", .. })
        ));
        assert!(matches!(
            reg.register("w-1.a~b_c", "ext", ExtensionKind::Widget),
            Err(BridgeError::DuplicateInstance(_))
        ));
    }

    #[test]
    fn test_unbound_target_drops() {
        let mut reg = InstanceRegistry::new();
        reg.register("a", "ext", ExtensionKind::Widget).unwrap();
        assert!(matches!(reg.route("a", json!(1), "b"), RouteOutcome::Dropped));
        assert!(matches!(reg.route("nobody", json!(1), "b"), RouteOutcome::Dropped));
    }

    #[test]
    fn test_same_target_order_preserved() {
        let mut reg = InstanceRegistry::new();
        reg.register("a", "ext", ExtensionKind::Widget).unwrap();
        let (send, seen) = recorder();
        reg.bind_sender("a", send).unwrap();
        for i in 0..5 {
            assert!(matches!(reg.route("a", json!(i), "b"), RouteOutcome::Delivered));
        }
        let payloads: Vec<Value> = seen.borrow().iter().map(|m| m.payload.clone()).collect();
        assert_eq!(payloads, (0..5).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[test]
    fn test_recipient_errors_and_panics_are_contained() {
        let mut reg = InstanceRegistry::new();
        reg.register("err", "ext", ExtensionKind::Widget).unwrap();
        reg.register("boom", "ext", ExtensionKind::Widget).unwrap();
        reg.bind_sender(
            "err",
            Rc::new(|_: &RoutedMessage| -> BridgeResult<()> {
                Err(BridgeError::RecipientBusy("err".into()))
            }),
        )
        .unwrap();
        reg.bind_sender(
            "boom",
            Rc::new(|_: &RoutedMessage| -> BridgeResult<()> { panic!("recipient blew up") }),
        )
        .unwrap();

        match reg.route("err", json!({}), "s") {
            RouteOutcome::Failed(BridgeError::RecipientFailure { recipient, .. }) => {
                assert_eq!(recipient, "err")
            }
            other => panic!("unexpected: {other:?}"),
        }
        match reg.route("boom", json!({}), "s") {
            RouteOutcome::Failed(BridgeError::RecipientFailure { message, .. }) => {
                assert_eq!(message, "recipient blew up")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_unregister_unbinds() {
        let mut reg = InstanceRegistry::new();
        reg.register("a", "ext", ExtensionKind::Primitive).unwrap();
        let (send, seen) = recorder();
        reg.bind_sender("a", send).unwrap();
        reg.unregister("a");
        assert!(matches!(reg.route("a", json!(1), "b"), RouteOutcome::Dropped));
        assert!(seen.borrow().is_empty());
        assert!(reg.bind_sender("a", recorder().0).is_err());
    }

    #[test]
    fn test_run_counters() {
        let mut reg = InstanceRegistry::new();
        reg.register("a", "ext", ExtensionKind::Block).unwrap();
        reg.register("b", "ext", ExtensionKind::Block).unwrap();
        assert_eq!(reg.decrement("a"), Some(0));
        reg.increment("a");
        reg.increment("a");
        reg.increment("b");
        assert_eq!(reg.run_count("a"), Some(2));
        assert!(reg.clear("a"));
        assert_eq!(reg.run_count("a"), Some(0));
        assert_eq!(reg.run_count("b"), Some(1));
        reg.clear_all();
        assert_eq!(reg.run_count("b"), Some(0));
        assert_eq!(reg.increment("missing"), None);
    }

    #[test]
    fn test_run_counter_saturates() {
        let mut reg = InstanceRegistry::new();
        reg.register("a", "ext", ExtensionKind::Widget).unwrap();
        reg.records.get_mut("a").unwrap().run_count = u32::MAX - 1;
        assert_eq!(reg.increment("a"), Some(u32::MAX));
        assert_eq!(reg.increment("a"), Some(u32::MAX));
        assert_eq!(reg.decrement("a"), Some(u32::MAX - 1));
    }
}
