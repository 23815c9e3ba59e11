//! The step state machine.
//!
//! A thread owns at most one [`StepHandler`]. The handler owns the outstanding
//! step request; every completed request goes through
//! [`StepHandler::on_step_event`], which decides whether to end the step or
//! issue a secondary request.

use std::sync::Arc;

use crate::element::EventDetail;
use crate::filter::StepFilters;
use crate::session::{Location, StepDepth, StepRequest, SuspendPolicy};
use crate::{RequestId, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Over,
    Into,
    Return,
    /// Step out until at most `remaining_frames` frames are left.
    ToFrame { remaining_frames: usize },
    /// Simulated frame drop: return out of `frames_to_drop` frames, then
    /// re-enter the target frame. The counter runs down to -1.
    DropToFrame { frames_to_drop: i64 },
}

impl StepKind {
    pub fn detail(&self) -> EventDetail {
        match self {
            StepKind::Over => EventDetail::StepOver,
            StepKind::Into => EventDetail::StepInto,
            StepKind::Return | StepKind::ToFrame { .. } | StepKind::DropToFrame { .. } => {
                EventDetail::StepReturn
            }
        }
    }

    pub(crate) fn depth(&self) -> StepDepth {
        match *self {
            StepKind::Over => StepDepth::Over,
            StepKind::Into => StepDepth::Into,
            StepKind::Return | StepKind::ToFrame { .. } => StepDepth::Out,
            StepKind::DropToFrame { frames_to_drop } if frames_to_drop > 0 => StepDepth::Out,
            StepKind::DropToFrame { frames_to_drop: 0 } => StepDepth::Reenter,
            StepKind::DropToFrame { .. } => StepDepth::Into,
        }
    }

    /// Only stepping into new frames is subject to step filters.
    pub(crate) fn applies_step_filters(&self) -> bool {
        matches!(self, StepKind::Into)
    }
}

/// Where the user-requested step started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OriginalStep {
    pub(crate) depth: StepDepth,
    pub(crate) location: Location,
    pub(crate) stack_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepTransition {
    /// Replace the request with a secondary one and let the thread run on.
    Continue,
    End,
}

#[derive(Debug)]
pub(crate) struct StepHandler {
    pub(crate) kind: StepKind,
    pub(crate) request: Option<RequestId>,
    filters: Arc<StepFilters>,
    /// Filter this step even when filtering is switched off globally.
    use_filters: bool,
}

impl StepHandler {
    pub(crate) fn new(kind: StepKind, filters: Arc<StepFilters>, use_filters: bool) -> Self {
        Self {
            kind,
            request: None,
            filters,
            use_filters,
        }
    }

    fn filtering(&self) -> bool {
        self.kind.applies_step_filters() && self.filters.applies(self.use_filters)
    }

    /// The request to create for the handler's current state.
    pub(crate) fn step_request(&self, thread: ThreadId, original: &OriginalStep) -> StepRequest {
        let mut class_exclusions = Vec::new();
        // A step that starts inside filtered code must be able to stop there again.
        if self.filtering() && !self.filters.type_is_filtered(&original.location.method.declaring_type) {
            class_exclusions = self.filters.active_patterns().to_vec();
        }
        StepRequest {
            thread,
            depth: self.kind.depth(),
            count: Some(1),
            class_exclusions,
            suspend_policy: SuspendPolicy::Thread,
        }
    }

    /// Whether [`Self::on_step_event`] needs the current frame count.
    pub(crate) fn needs_frame_count(&self, original: &OriginalStep) -> bool {
        match self.kind {
            StepKind::ToFrame { .. } => true,
            StepKind::DropToFrame { .. } => false,
            _ => original.depth == StepDepth::Into,
        }
    }

    /// The thread resumes through a forced return rather than a plain resume.
    pub(crate) fn resumes_with_return(&self) -> bool {
        matches!(self.kind, StepKind::DropToFrame { frames_to_drop } if frames_to_drop >= 0)
    }

    fn should_be_filtered(&self, landing: &Location, original: &OriginalStep) -> bool {
        self.filtering()
            && !self.filters.location_is_filtered(&original.location, self.use_filters)
            && self.filters.location_is_filtered(landing, self.use_filters)
    }

    /// A step into that only found filtered code comes back to the line it
    /// started on. It needs another step.
    fn should_step_into_again(&self, landing: &Location, frame_count: Option<usize>, original: &OriginalStep) -> bool {
        original.depth == StepDepth::Into
            && frame_count == Some(original.stack_depth)
            && original.location.same_line_as(landing)
    }

    pub(crate) fn on_step_event(
        &mut self,
        landing: &Location,
        frame_count: Option<usize>,
        original: &OriginalStep,
    ) -> StepTransition {
        let proceed = match self.kind {
            StepKind::Over | StepKind::Into | StepKind::Return => {
                self.should_be_filtered(landing, original)
                    || self.should_step_into_again(landing, frame_count, original)
            }
            StepKind::ToFrame { remaining_frames } => {
                frame_count.is_some_and(|count| count > remaining_frames)
            }
            StepKind::DropToFrame { frames_to_drop } => {
                let frames_to_drop = frames_to_drop - 1;
                self.kind = StepKind::DropToFrame { frames_to_drop };
                frames_to_drop >= -1
            }
        };
        if proceed {
            StepTransition::Continue
        } else {
            StepTransition::End
        }
    }
}
