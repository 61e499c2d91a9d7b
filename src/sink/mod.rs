//! Native audio outputs driving a [`RenderConsumer`](crate::RenderConsumer).

#[cfg(feature = "cpal_sink")]
mod cpal_sink;

#[cfg(feature = "cpal_sink")]
pub use cpal_sink::CpalSink;
