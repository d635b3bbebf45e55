//! Command dispatch.
//!
//! A [`Dispatcher`] maps command names to callbacks. Callbacks are registered
//! up front; registering a name twice replaces the earlier callback, and
//! [`Dispatcher::merge`] lets the merged-in table win on conflicts.

use crate::client::ClientHandle;
use crate::error::{ClientError, HandlerError};
use livedm_protocol::command_name;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

/// Receives decoded commands from a client.
pub trait Handler: Send + Sync {
    /// Called once per command, in arrival order.
    fn handle(&self, client: &ClientHandle, command: &Value) -> Result<(), HandlerError>;

    /// Called after the client's network loop has exited.
    fn on_client_stopped(&self, _client: &ClientHandle, _error: Option<&ClientError>) {}
}

/// Callback registered for one command name.
pub type Callback = Arc<dyn Fn(&ClientHandle, &Value) -> Result<(), HandlerError> + Send + Sync>;

/// Commands that arrive often and are deliberately not handled. They are
/// never reported as unknown.
pub const QUIET_COMMANDS: &[&str] = &[
    "COMBO_SEND",
    "ENTRY_EFFECT",
    "HOT_RANK_CHANGED",
    "HOT_RANK_CHANGED_V2",
    "LIVE",
    "LIVE_INTERACTIVE_GAME",
    "NOTICE_MSG",
    "ONLINE_RANK_COUNT",
    "ONLINE_RANK_TOP3",
    "ONLINE_RANK_V2",
    "PK_BATTLE_END",
    "PK_BATTLE_FINAL_PROCESS",
    "PK_BATTLE_PROCESS",
    "PK_BATTLE_PROCESS_NEW",
    "PK_BATTLE_SETTLE",
    "PK_BATTLE_SETTLE_USER",
    "PK_BATTLE_SETTLE_V2",
    "PREPARING",
    "ROOM_REAL_TIME_MESSAGE_UPDATE",
    "STOP_LIVE_ROOM_LIST",
    "SUPER_CHAT_MESSAGE_JPN",
    "USER_TOAST_MSG",
    "WIDGET_BANNER",
];

/// Registry of command callbacks.
pub struct Dispatcher {
    callbacks: HashMap<String, Callback>,
    logged_unknown: Mutex<HashSet<String>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            callbacks: HashMap::new(),
            logged_unknown: Mutex::new(QUIET_COMMANDS.iter().map(|s| s.to_string()).collect()),
        }
    }

    /// Registers `callback` for `cmd`, returning the callback it replaced.
    pub fn register<F>(&mut self, cmd: impl Into<String>, callback: F) -> Option<Callback>
    where
        F: Fn(&ClientHandle, &Value) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.callbacks.insert(cmd.into(), Arc::new(callback))
    }

    /// Builder form of [`Dispatcher::register`].
    pub fn on<F>(mut self, cmd: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&ClientHandle, &Value) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(cmd, callback);
        self
    }

    /// Marks `cmd` as known so it is dropped without logging.
    pub fn ignore(&self, cmd: impl Into<String>) {
        self.logged_unknown.lock().insert(cmd.into());
    }

    /// Merges `other` into `self`. Callbacks from `other` win on conflicts.
    pub fn merge(&mut self, other: Dispatcher) {
        self.callbacks.extend(other.callbacks);
        self.logged_unknown
            .lock()
            .extend(other.logged_unknown.into_inner());
    }

    pub fn unregister(&mut self, cmd: &str) -> Option<Callback> {
        self.callbacks.remove(cmd)
    }

    pub fn is_registered(&self, cmd: &str) -> bool {
        self.callbacks.contains_key(cmd)
    }

    /// Dispatches a command or an array of commands, in order.
    ///
    /// Callback failures are logged and do not stop the remaining commands.
    pub fn dispatch(&self, client: &ClientHandle, command: &Value) {
        if let Value::Array(commands) = command {
            for command in commands {
                self.dispatch(client, command);
            }
            return;
        }

        let cmd = command_name(command);
        let Some(callback) = self.callbacks.get(cmd) else {
            self.note_unknown(client, cmd, command);
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| callback(client, command))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    room_id = client.room_id(),
                    cmd,
                    %command,
                    "Command handler failed: {}",
                    e
                );
            }
            Err(panic) => {
                error!(
                    room_id = client.room_id(),
                    cmd,
                    %command,
                    "Command handler panicked: {}",
                    panic_message(&*panic)
                );
            }
        }
    }

    /// Records an unknown command. Returns true the first time a name is seen.
    fn note_unknown(&self, client: &ClientHandle, cmd: &str, command: &Value) -> bool {
        let first = self.logged_unknown.lock().insert(cmd.to_string());
        if first {
            warn!(room_id = client.room_id(), cmd, %command, "Unknown command");
        }
        first
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.callbacks.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Dispatcher").field("commands", &names).finish()
    }
}

impl Handler for Dispatcher {
    fn handle(&self, client: &ClientHandle, command: &Value) -> Result<(), HandlerError> {
        self.dispatch(client, command);
        Ok(())
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::WarnCounter;
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, Dispatcher) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = seen.clone();
        let b = seen.clone();
        let dispatcher = Dispatcher::new()
            .on("A", move |_, cmd| {
                a.lock().push(format!("A:{}", cmd["data"]["n"]));
                Ok(())
            })
            .on("B", move |_, _| {
                b.lock().push("B".to_string());
                Ok(())
            });
        (seen, dispatcher)
    }

    #[test]
    fn test_array_dispatch_in_order() {
        let (seen, dispatcher) = recorder();
        let client = ClientHandle::detached(1);

        dispatcher.dispatch(
            &client,
            &json!([{"cmd": "A", "data": {"n": 1}}, {"cmd": "B", "data": {}}, {"cmd": "A", "data": {"n": 2}}]),
        );
        assert_eq!(*seen.lock(), vec!["A:1", "B", "A:2"]);
    }

    #[test]
    fn test_cmd_suffix_is_ignored() {
        let (seen, dispatcher) = recorder();
        let client = ClientHandle::detached(1);

        dispatcher.dispatch(&client, &json!({"cmd": "B:4:0:2:2:2:0", "info": []}));
        assert_eq!(*seen.lock(), vec!["B"]);
    }

    #[test]
    fn test_unknown_logged_once() {
        let (_, dispatcher) = recorder();
        let client = ClientHandle::detached(1);
        let unknown = json!({"cmd": "SOMETHING_NEW"});

        assert!(dispatcher.note_unknown(&client, "SOMETHING_NEW", &unknown));
        assert!(!dispatcher.note_unknown(&client, "SOMETHING_NEW", &unknown));
        assert!(!dispatcher.note_unknown(&client, "WIDGET_BANNER", &unknown));

        dispatcher.ignore("ANOTHER");
        assert!(!dispatcher.note_unknown(&client, "ANOTHER", &unknown));
    }

    #[test]
    fn test_unknown_warns_once_through_dispatch() {
        let (seen, dispatcher) = recorder();
        let client = ClientHandle::detached(1);
        let warnings = WarnCounter::default();
        let count = || warnings.count();

        tracing::subscriber::with_default(warnings.subscriber(), || {
            dispatcher.dispatch(&client, &json!({"cmd": "SOMETHING_NEW"}));
            assert_eq!(count(), 1);

            dispatcher.dispatch(
                &client,
                &json!([{"cmd": "SOMETHING_NEW"}, {"cmd": "B"}, {"cmd": "SOMETHING_NEW:1"}]),
            );
            dispatcher
                .handle(&client, &json!({"cmd": "SOMETHING_NEW", "data": {}}))
                .unwrap();
            assert_eq!(count(), 1);

            dispatcher.dispatch(&client, &json!({"cmd": "WIDGET_BANNER"}));
            assert_eq!(count(), 1);

            dispatcher.dispatch(&client, &json!({"cmd": "OTHER_NEW"}));
            dispatcher.dispatch(&client, &json!({"cmd": "OTHER_NEW"}));
            assert_eq!(count(), 2);
        });
        assert_eq!(*seen.lock(), vec!["B"]);
    }

    #[test]
    fn test_failing_callback_does_not_stop_others() {
        let (seen, mut dispatcher) = recorder();
        dispatcher.register("ERR", |_, _| Err("bad payload".into()));
        dispatcher.register("PANIC", |_, _| panic!("handler bug"));
        let client = ClientHandle::detached(1);

        dispatcher.dispatch(
            &client,
            &json!([{"cmd": "ERR"}, {"cmd": "PANIC"}, {"cmd": "B"}]),
        );
        assert_eq!(*seen.lock(), vec!["B"]);
    }

    #[test]
    fn test_register_replaces_and_merge_overrides() {
        let (seen, mut dispatcher) = recorder();
        let replaced = seen.clone();
        let old = dispatcher.register("B", move |_, _| {
            replaced.lock().push("B2".to_string());
            Ok(())
        });
        assert!(old.is_some());

        let merged = seen.clone();
        let other = Dispatcher::new().on("A", move |_, _| {
            merged.lock().push("A-merged".to_string());
            Ok(())
        });
        dispatcher.merge(other);

        let client = ClientHandle::detached(1);
        dispatcher.dispatch(&client, &json!([{"cmd": "A"}, {"cmd": "B"}]));
        assert_eq!(*seen.lock(), vec!["A-merged", "B2"]);

        assert!(dispatcher.unregister("A").is_some());
        assert!(!dispatcher.is_registered("A"));
    }

    #[test]
    fn test_missing_cmd_is_empty_name() {
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        let dispatcher = Dispatcher::new().on("", move |_, _| {
            *counter.lock() += 1;
            Ok(())
        });
        dispatcher.dispatch(&ClientHandle::detached(1), &json!({"data": {}}));
        assert_eq!(*seen.lock(), 1);
    }
}
