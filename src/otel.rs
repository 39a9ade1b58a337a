// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Trace Context Propagation
//!
//! Carries OpenTelemetry context across the broker in AMQP message headers:
//! the publisher injects the current context, the consumer extracts it and
//! opens a consumer span as its child.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context, KeyValue,
};
use std::collections::BTreeMap;
use tracing::warn;

struct HeaderInjector<'a>(&'a mut BTreeMap<ShortString, AMQPValue>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(
            ShortString::from(key.to_lowercase()),
            AMQPValue::LongString(value.into()),
        );
    }
}

struct HeaderExtractor<'a>(&'a BTreeMap<ShortString, AMQPValue>);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|err| warn!(error = err.to_string(), key, "non utf-8 trace header"))
                .ok(),
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

/// Headers holding the propagation fields of `ctx`.
pub(crate) fn inject(ctx: &Context) -> FieldTable {
    let mut headers = BTreeMap::new();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector(&mut headers))
    });

    FieldTable::from(headers)
}

/// Extracts the remote context from `props` and starts a consumer span for a
/// delivery from `queue`.
///
/// # Parameters
/// * `props` - Properties of the delivery; trace headers are read from here
/// * `tracer` - The consumer tracer
/// * `queue` - Used as the span name
///
/// # Returns
/// The extracted context, to hand to the handler, and the started span
pub(crate) fn consumer_span(
    props: &AMQPProperties,
    tracer: &BoxedTracer,
    queue: &str,
) -> (Context, BoxedSpan) {
    let empty = FieldTable::default();
    let headers = props.headers().as_ref().unwrap_or(&empty);

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(headers.inner()))
    });

    let span = tracer
        .span_builder(format!("{queue} receive"))
        .with_kind(SpanKind::Consumer)
        .with_attributes(vec![
            KeyValue::new("messaging.system", "rabbitmq"),
            KeyValue::new("messaging.destination.name", queue.to_owned()),
        ])
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
