//! Progress reporting for erase and write passes

/// Number of operations after which a pulsed report turns determinate.
///
/// Erase-heavy passes give no useful percentage early on because sector
/// erase times vary wildly, so the display pulses until enough
/// operations have completed to extrapolate from.
pub const PULSE_THRESHOLD: usize = 12;

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// A pass of `total` operations is starting.
    fn init(&mut self, total: usize, pulsed: bool);
    /// `current` operations have completed.
    fn update(&mut self, current: usize);
    /// The pass finished successfully.
    fn finish(&mut self);
}

/// A no-op progress implementation
pub struct NoProgress;

impl ProgressCallbacks for NoProgress {
    fn init(&mut self, _total: usize, _pulsed: bool) {}
    fn update(&mut self, _current: usize) {}
    fn finish(&mut self) {}
}

/// What a front end should display for a given progress state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayState {
    /// Activity without a meaningful percentage.
    Indeterminate,
    /// Percentage of planned operations completed.
    Percent(u8),
}

/// Convert an operation count into a display state.
pub fn display_state(count: usize, max: usize, pulsed: bool) -> DisplayState {
    if pulsed && count <= PULSE_THRESHOLD {
        return DisplayState::Indeterminate;
    }

    if max == 0 {
        DisplayState::Percent(100)
    } else {
        DisplayState::Percent((100 * count / max) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulses_until_threshold() {
        assert_eq!(display_state(0, 100, true), DisplayState::Indeterminate);
        assert_eq!(display_state(12, 100, true), DisplayState::Indeterminate);
        assert_eq!(display_state(13, 100, true), DisplayState::Percent(13));
        assert_eq!(display_state(100, 100, true), DisplayState::Percent(100));
    }

    #[test]
    fn determinate_from_the_start_when_not_pulsed() {
        assert_eq!(display_state(0, 10, false), DisplayState::Percent(0));
        assert_eq!(display_state(5, 10, false), DisplayState::Percent(50));
        assert_eq!(display_state(10, 10, false), DisplayState::Percent(100));
    }

    #[test]
    fn empty_pass_is_complete() {
        assert_eq!(display_state(0, 0, false), DisplayState::Percent(100));
    }
}
