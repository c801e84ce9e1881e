//! Chrome trace output behind the `profiling` feature.
//!
//! The encode, quantize and decode stages each run inside an `info_span!`.
//! With the feature enabled, [`init`] installs a `tracing-chrome` layer that
//! records those spans (and the per-stage `debug!` events) to a trace file
//! viewable in `chrome://tracing` or [Perfetto](https://ui.perfetto.dev).
//! Without it, [`init`] returns `None`.

/// Flushes the trace file when dropped. Keep it alive until the workload ends.
#[cfg(feature = "profiling")]
pub struct ProfilingGuard {
    _guard: tracing_chrome::FlushGuard,
}

/// Placeholder when profiling is compiled out.
#[cfg(not(feature = "profiling"))]
pub struct ProfilingGuard;

/// Start writing a Chrome trace to `path`.
///
/// ```rust,ignore
/// let _guard = encodec::profiling::init("encodec-trace.json");
/// ctx.reconstruct(&samples, 4)?;
/// ```
#[allow(unused_variables)]
pub fn init(path: &str) -> Option<ProfilingGuard> {
    #[cfg(feature = "profiling")]
    {
        use tracing_chrome::ChromeLayerBuilder;
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let (chrome_layer, guard) = ChromeLayerBuilder::new()
            .file(path)
            .include_args(true)
            .build();

        tracing_subscriber::registry().with(chrome_layer).init();

        tracing::info!("Profiling enabled, writing trace to {path}");
        Some(ProfilingGuard { _guard: guard })
    }

    #[cfg(not(feature = "profiling"))]
    {
        None
    }
}
