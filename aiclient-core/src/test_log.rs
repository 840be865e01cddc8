#![cfg(test)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{Event, Level, Subscriber};
use tracing_core::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{Layer, registry};

#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
    pub fields: HashMap<String, String>,
}

#[derive(Default, Debug)]
pub struct EventStore {
    pub events: Mutex<Vec<CapturedEvent>>,
}

impl EventStore {
    /// Events at `level` whose message contains `needle`.
    pub fn count(&self, level: Level, needle: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.level == level && e.message.contains(needle))
            .count()
    }

    /// Field `name` of the first event at `level` whose message contains `needle`.
    pub fn field(&self, level: Level, needle: &str, name: &str) -> Option<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.level == level && e.message.contains(needle))
            .and_then(|e| e.fields.get(name).cloned())
    }

    pub fn count_level(&self, level: Level) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.level == level)
            .count()
    }
}

#[derive(Clone)]
pub struct CaptureLayer {
    pub store: Arc<EventStore>,
}

struct MapVisitor<'a> {
    map: &'a mut HashMap<String, String>,
}

impl Visit for MapVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn core::fmt::Debug) {
        self.map.insert(field.name().to_string(), format!("{value:?}"));
    }
    fn record_str(&mut self, field: &Field, value: &str) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.map.insert(field.name().to_string(), format!("{value}"));
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = HashMap::new();
        event.record(&mut MapVisitor { map: &mut fields });
        let message = fields.remove("message").unwrap_or_default();
        self.store.events.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            message,
            fields,
        });
    }
}

/// Capture events emitted on the current thread until the guard drops.
/// Pair with a current-thread runtime so spawned tasks are covered too.
pub fn install_capture() -> (Arc<EventStore>, tracing::subscriber::DefaultGuard) {
    let store = Arc::new(EventStore::default());
    let layer = CaptureLayer {
        store: store.clone(),
    };
    let subscriber = registry::Registry::default().with(layer);
    let guard = tracing::subscriber::set_default(subscriber);
    (store, guard)
}
