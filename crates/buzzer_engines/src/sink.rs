#![forbid(unsafe_code)]

use buzzer_contracts::pitch::Pitch;

use crate::sign::SignError;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error(transparent)]
    Sign(#[from] SignError),

    #[error("sink closed")]
    Closed,

    /// Not delivered now; the same pitch may be offered again later.
    #[error("sink busy")]
    Busy,
}

/// Anything that wants to hear about a newly announced pitch: the sign, the
/// device display, the controller's queue.
pub trait PitchSink: Send {
    fn update(&mut self, pitch: &Pitch) -> Result<(), SinkError>;

    fn stop(&mut self) -> Result<(), SinkError>;
}

/// Fans one notification out to several sinks. Every sink is called even if
/// an earlier one fails; the first error is returned.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn PitchSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Box<dyn PitchSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl PitchSink for FanoutSink {
    fn update(&mut self, pitch: &Pitch) -> Result<(), SinkError> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(err) = sink.update(pitch) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn stop(&mut self) -> Result<(), SinkError> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(err) = sink.stop() {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
