//! Progress and abort hooks injected into the training loop

/// Hooks polled by the training loop once per tick
#[cfg_attr(test, mockall::automock)]
pub trait TrainingCallbacks: Send {
    /// Called at the start of training and at every tick
    fn on_progress(&mut self, _cur_nimg: u64, _total_nimg: u64) {}

    /// Whether training should stop at the end of the current tick
    fn should_abort(&mut self) -> bool {
        false
    }
}

/// Callbacks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl TrainingCallbacks for NoopCallbacks {}

/// Callbacks built from plain closures
#[derive(Default)]
pub struct ClosureCallbacks {
    progress: Option<Box<dyn FnMut(u64, u64) + Send>>,
    abort: Option<Box<dyn FnMut() -> bool + Send>>,
}

impl ClosureCallbacks {
    /// Create empty callbacks
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the progress closure
    pub fn with_progress(mut self, f: impl FnMut(u64, u64) + Send + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    /// Set the abort predicate
    pub fn with_abort(mut self, f: impl FnMut() -> bool + Send + 'static) -> Self {
        self.abort = Some(Box::new(f));
        self
    }
}

impl TrainingCallbacks for ClosureCallbacks {
    fn on_progress(&mut self, cur_nimg: u64, total_nimg: u64) {
        if let Some(f) = self.progress.as_mut() {
            f(cur_nimg, total_nimg);
        }
    }

    fn should_abort(&mut self) -> bool {
        self.abort.as_mut().map_or(false, |f| f())
    }
}
