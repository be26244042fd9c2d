use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::{field::Visit, Level, Subscriber};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

/// Layer that keeps every event it sees, for assertions on emitted logs.
#[derive(Debug, Default)]
pub(crate) struct CapturedEvents {
    pub events: Arc<Mutex<Vec<CapturedEvent>>>,
}

#[derive(Debug, Clone)]
pub(crate) struct CapturedEvent {
    pub level: Level,
    pub target: String,
    pub fields: HashMap<String, String>,
    pub name: String,
    pub span_name: Option<String>,
}

impl CapturedEvent {
    pub fn message(&self) -> Option<&str> {
        self.fields.get("message").map(String::as_str)
    }
}

struct MyVisitor<'a>(pub &'a mut HashMap<String, String>);

impl<'a> Visit for MyVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), format!("{:?}", value));
    }
}

impl<S> Layer<S> for CapturedEvents
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let mut fields = HashMap::new();
        event.record(&mut MyVisitor(&mut fields));

        let parent_span_name = ctx
            .current_span()
            .metadata()
            .map(|metadata| metadata.name().to_string());

        self.events.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            fields,
            name: event.metadata().name().to_string(),
            span_name: parent_span_name,
        });
    }
}
