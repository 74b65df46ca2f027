use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const RING_CAPACITY: usize = 500;
const DEFAULT_FILTER: &str = "quill_server=info,quill_core=info,quill_agent=info,tower_http=info";

pub(crate) type LogRing = Arc<Mutex<VecDeque<String>>>;

/// Recent log lines for `/api/logs`: a replay buffer plus the live feed.
#[derive(Clone)]
pub(crate) struct LogHub {
    pub tx: broadcast::Sender<String>,
    pub ring: LogRing,
}

impl LogHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(RING_CAPACITY))),
        }
    }

    /// Ring contents, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn push(&self, line: String) {
        let _ = self.tx.send(line.clone());
        if let Ok(mut ring) = self.ring.lock() {
            ring.push_back(line);
            if ring.len() > RING_CAPACITY {
                ring.pop_front();
            }
        }
    }
}

/// fmt output to stderr plus the broadcast layer, filtered by `RUST_LOG`.
pub(crate) fn init(hub: &LogHub) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(BroadcastLayer { hub: hub.clone() })
        .init();
}

pub(crate) struct BroadcastLayer {
    pub hub: LogHub,
}

struct MessageVisitor<'a> {
    message: &'a mut String,
    fields: &'a mut serde_json::Map<String, serde_json::Value>,
}

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            *self.message = value.to_string();
        } else {
            self.fields.insert(field.name().into(), value.into());
        }
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().into(), value.into());
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().into(), value.into());
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().into(), value.into());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let mut text = format!("{value:?}");
        // Strip surrounding quotes added by Debug on &str
        if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
            text = text[1..text.len() - 1].to_string();
        }
        if field.name() == "message" {
            *self.message = text;
        } else {
            self.fields.insert(field.name().into(), text.into());
        }
    }
}

fn category(target: &str) -> &'static str {
    if target.contains("queue") || target.contains("pipeline") {
        "queue"
    } else if target.contains("dispatch") || target.contains("runner") || target.contains("supervisor") {
        "jobs"
    } else if target.contains("webhook") {
        "webhook"
    } else if target.contains("agent") {
        "agent"
    } else {
        "system"
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for BroadcastLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => "err",
            tracing::Level::WARN => "warn",
            tracing::Level::INFO => "info",
            tracing::Level::DEBUG => "debug",
            tracing::Level::TRACE => return,
        };

        let mut message = String::new();
        let mut fields = serde_json::Map::new();
        event.record(&mut MessageVisitor {
            message: &mut message,
            fields: &mut fields,
        });

        let json = serde_json::json!({
            "ts": chrono::Utc::now().timestamp(),
            "level": level,
            "message": message,
            "category": category(event.metadata().target()),
            "fields": fields,
        })
        .to_string();

        self.hub.push(json);
    }
}
