/// Progress reporting for long lifecycle operations
use std::sync::Arc;

pub trait ProgressSink: Send + Sync {
    fn report(&self, fraction: f64, message: &str);
}

/// Handle that maps its own 0..1 range onto a span of the root range.
#[derive(Clone)]
pub struct Progress {
    sink: Option<Arc<dyn ProgressSink>>,
    base: f64,
    span: f64,
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("base", &self.base)
            .field("span", &self.span)
            .field("reporting", &self.sink.is_some())
            .finish()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::none()
    }
}

impl Progress {
    /// Progress that goes nowhere.
    pub fn none() -> Self {
        Self {
            sink: None,
            base: 0.0,
            span: 1.0,
        }
    }

    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink: Some(sink),
            base: 0.0,
            span: 1.0,
        }
    }

    /// Report `fraction` (clamped to 0..1) of this handle's range.
    pub fn set(&self, fraction: f64, message: &str) {
        if let Some(sink) = &self.sink {
            sink.report(self.base + self.span * fraction.clamp(0.0, 1.0), message);
        }
    }

    /// Sub-range `[from, to]` of this handle, both given in this handle's
    /// own 0..1 units.
    pub fn child(&self, from: f64, to: f64) -> Progress {
        let from = from.clamp(0.0, 1.0);
        let to = to.clamp(from, 1.0);
        Progress {
            sink: self.sink.clone(),
            base: self.base + self.span * from,
            span: self.span * (to - from),
        }
    }

    pub fn finish(&self, message: &str) {
        self.set(1.0, message);
    }
}
