// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracing formatter and subscriber setup for agent logs.
//!
//! Agent log lines share the host process's output, so every line is prefixed
//! with `APM_AGENT` to make it easy to filter:
//!
//! ```text
//! APM_AGENT | LEVEL | [span_name{span_fields}:] message {event_fields}
//! ```
//!
//! ```text
//! APM_AGENT | INFO | AGENT | Starting agent, sleep interval 60s
//! APM_AGENT | WARN | delivery{attempt=2}: TRANSMITTER | Transport error connection refused
//! ```

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::log_level::LogLevel;

/// Log formatter that prefixes messages with `APM_AGENT`.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "APM_AGENT | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Installs a global subscriber using [`Formatter`] at the given level.
///
/// Best effort: if the host already installed a global subscriber, agent
/// events flow into that one instead and this call does nothing.
pub fn init(level: LogLevel) {
    let filter = EnvFilter::new(format!("apm_agent={}", level.as_ref().to_lowercase()));
    let result = tracing_subscriber::fmt()
        .event_format(Formatter)
        .with_env_filter(filter)
        .try_init();
    if result.is_err() {
        tracing::debug!("A global tracing subscriber is already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("lock poisoned").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = Buffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_formatter_prefixes_level_and_spans() {
        let buffer = Buffer::default();
        let subscriber = tracing_subscriber::fmt()
            .event_format(Formatter)
            .with_writer(buffer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("delivery", attempt = 2);
            let _entered = span.enter();
            tracing::warn!("TRANSMITTER | Transport error");
        });

        let output = String::from_utf8(buffer.0.lock().expect("lock poisoned").clone())
            .expect("utf8 output");
        assert_eq!(
            output,
            "APM_AGENT | WARN | delivery{attempt=2}: TRANSMITTER | Transport error\n"
        );
    }
}
