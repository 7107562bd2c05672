use crate::domain::error::SessionError;
use crate::domain::models::AtomizerMode;

// Index 0 of every table is reserved and never selectable.
pub const DAB_TEMPS_F: &[u16] = &[0, 482, 500, 518, 536, 554, 572, 590, 608, 626, 644];
pub const FLOWER_TEMPS_F: &[u16] = &[0, 356, 374, 392, 410, 428];
pub const DAB_TIMES: &[&str] = &[
    "0:00", "0:20", "0:25", "0:30", "0:35", "0:40", "0:45", "0:50", "0:55", "1:00",
];
pub const FLOWER_TIMES: &[&str] = &[
    "0:00", "1:00", "1:30", "2:00", "2:30", "3:00", "3:30", "4:00", "4:15",
];

/// Current preset selection and what the device last reported
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub atomizer_mode: AtomizerMode,
    temp_index: usize,
    time_index: usize,
    pub dab_count: u16,
    pub flower_count: u16,
    pub active: bool,
    pub remaining_seconds: f32,
}

impl SessionState {
    /// Build from persisted indices. A stored 0 means "never set".
    pub fn new(temp_index: usize, time_index: usize) -> Self {
        let mut state = Self {
            atomizer_mode: AtomizerMode::Dab,
            temp_index,
            time_index,
            dab_count: 0,
            flower_count: 0,
            active: false,
            remaining_seconds: 0.0,
        };
        state.clamp_indices();
        state
    }

    pub fn temperature_table(&self) -> &'static [u16] {
        match self.atomizer_mode {
            AtomizerMode::Dab => DAB_TEMPS_F,
            AtomizerMode::Flower => FLOWER_TEMPS_F,
        }
    }

    pub fn time_table(&self) -> &'static [&'static str] {
        match self.atomizer_mode {
            AtomizerMode::Dab => DAB_TIMES,
            AtomizerMode::Flower => FLOWER_TIMES,
        }
    }

    pub fn temp_index(&self) -> usize {
        self.temp_index
    }

    pub fn time_index(&self) -> usize {
        self.time_index
    }

    pub fn select_temperature(&mut self, index: usize) -> Result<(), SessionError> {
        self.temp_index = checked_index("temperature", index, self.temperature_table().len())?;
        Ok(())
    }

    pub fn select_time(&mut self, index: usize) -> Result<(), SessionError> {
        self.time_index = checked_index("time", index, self.time_table().len())?;
        Ok(())
    }

    /// Switch tables. Returns true if a selected index had to be clamped.
    pub fn set_mode(&mut self, mode: AtomizerMode) -> bool {
        self.atomizer_mode = mode;
        self.clamp_indices()
    }

    pub fn temperature_f(&self) -> u16 {
        self.temperature_table()[self.temp_index]
    }

    pub fn temperature_label(&self) -> String {
        self.temperature_f().to_string()
    }

    pub fn time_label(&self) -> &'static str {
        self.time_table()[self.time_index]
    }

    fn clamp_indices(&mut self) -> bool {
        let before = (self.temp_index, self.time_index);
        self.temp_index = self.temp_index.clamp(1, self.temperature_table().len() - 1);
        self.time_index = self.time_index.clamp(1, self.time_table().len() - 1);
        before != (self.temp_index, self.time_index)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

fn checked_index(table: &'static str, index: usize, len: usize) -> Result<usize, SessionError> {
    if (1..len).contains(&index) {
        Ok(index)
    } else {
        Err(SessionError::IndexOutOfRange {
            table,
            index,
            max: len - 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol;

    #[test]
    fn test_zero_indices_resolve_to_first_preset() {
        let state = SessionState::new(0, 0);
        assert_eq!(state.temp_index(), 1);
        assert_eq!(state.time_index(), 1);
        assert_eq!(state.temperature_f(), 482);
        assert_eq!(state.time_label(), "0:20");
    }

    #[test]
    fn test_stored_index_clamped_to_table() {
        let state = SessionState::new(99, 99);
        assert_eq!(state.temp_index(), DAB_TEMPS_F.len() - 1);
        assert_eq!(state.time_index(), DAB_TIMES.len() - 1);
    }

    #[test]
    fn test_selection_never_resolves_to_zero() {
        for mode in [AtomizerMode::Dab, AtomizerMode::Flower] {
            let mut state = SessionState::default();
            state.set_mode(mode);

            assert!(state.select_temperature(0).is_err());
            assert!(state.select_time(0).is_err());
            assert_eq!(state.temp_index(), 1);
            assert_eq!(state.time_index(), 1);

            let temps = state.temperature_table().len();
            assert!(state.select_temperature(temps).is_err());
            assert!(state.select_temperature(temps - 1).is_ok());
            assert_eq!(state.temp_index(), temps - 1);
        }
    }

    #[test]
    fn test_out_of_range_error_reports_bounds() {
        let mut state = SessionState::default();
        assert_eq!(
            state.select_time(42),
            Err(SessionError::IndexOutOfRange {
                table: "time",
                index: 42,
                max: DAB_TIMES.len() - 1,
            })
        );
    }

    #[test]
    fn test_mode_switch_clamps_selection() {
        let mut state = SessionState::default();
        state.select_temperature(10).unwrap();
        assert!(state.set_mode(AtomizerMode::Flower));
        assert_eq!(state.temp_index(), FLOWER_TEMPS_F.len() - 1);
        assert_eq!(state.temperature_f(), 428);

        assert!(!state.set_mode(AtomizerMode::Dab));
        assert_eq!(state.temperature_f(), DAB_TEMPS_F[5]);
    }

    #[test]
    fn test_every_duration_fits_the_wire() {
        for label in DAB_TIMES.iter().chain(FLOWER_TIMES).skip(1) {
            let seconds = protocol::parse_duration(label).unwrap();
            assert!(seconds <= u8::MAX as u32, "{label} is too long");
        }
    }
}
