#![cfg(test)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{Subscriber, span};
use tracing_core::field::{Field, Visit};
use tracing_subscriber::{Layer, layer::Context, registry::LookupSpan};

/// Fields recorded on one span, stringified.
#[derive(Default, Debug)]
pub struct SpanData {
    pub name: String,
    pub fields: Mutex<HashMap<String, String>>,
}

#[derive(Default, Debug)]
pub struct SpanStore {
    pub spans: Mutex<Vec<Arc<SpanData>>>,
    by_id: Mutex<HashMap<span::Id, Arc<SpanData>>>,
}

impl SpanStore {
    /// Fields of the first span with this name.
    pub fn fields_of(&self, name: &str) -> Option<HashMap<String, String>> {
        let spans = self.spans.lock().unwrap();
        let data = spans.iter().find(|s| s.name == name)?;
        Some(data.fields.lock().unwrap().clone())
    }
}

struct MapVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for MapVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn core::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }
}

#[derive(Clone)]
pub struct CaptureLayer {
    store: Arc<SpanStore>,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, _ctx: Context<'_, S>) {
        let data = Arc::new(SpanData {
            name: attrs.metadata().name().to_string(),
            ..Default::default()
        });
        attrs.record(&mut MapVisitor(&mut data.fields.lock().unwrap()));
        self.store.spans.lock().unwrap().push(data.clone());
        self.store.by_id.lock().unwrap().insert(id.clone(), data);
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, _ctx: Context<'_, S>) {
        if let Some(data) = self.store.by_id.lock().unwrap().get(id) {
            values.record(&mut MapVisitor(&mut data.fields.lock().unwrap()));
        }
    }
}

/// Install a capturing subscriber as the default for the current thread.
/// Keep the returned guard alive for the duration of the test.
pub fn install_capture() -> (Arc<SpanStore>, tracing::subscriber::DefaultGuard) {
    use tracing_subscriber::prelude::*;
    let store = Arc::new(SpanStore::default());
    let layer = CaptureLayer {
        store: store.clone(),
    };
    let subscriber = tracing_subscriber::registry::Registry::default().with(layer);
    let guard = tracing::subscriber::set_default(subscriber);
    (store, guard)
}
