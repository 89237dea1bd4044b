//! Custom tracing layers

use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;

/// Create a JSONL formatting layer for file output
///
/// Every line carries the current span and the span list, so the `site`,
/// `request`, and `hop` fields of the enclosing relay spans travel with it.
pub fn jsonl_file_layer<S, W>(
    writer: W,
    include_location: bool,
    include_thread_info: bool,
) -> tracing_subscriber::fmt::Layer<
    S,
    tracing_subscriber::fmt::format::JsonFields,
    tracing_subscriber::fmt::format::Format<tracing_subscriber::fmt::format::Json>,
    W,
>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .flatten_event(true)
        .with_file(include_location)
        .with_line_number(include_location)
        .with_thread_ids(include_thread_info)
        .with_thread_names(include_thread_info)
        .with_writer(writer)
}
