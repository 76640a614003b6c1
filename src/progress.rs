/// Receives integer progress in the range [0, 100].
pub trait ProgressReporter {
    fn report(&mut self, percent: u8);
}

/// Progress accounting across the plan and execute passes.
///
/// The plan pass sums the expected work with [`Progress::plan`]; the execute
/// pass moves through it with [`Progress::advance`]. The reporter is only
/// called when the integer percentage changes, 0 is always reported first
/// and 100 last (after the sink is closed).
pub struct Progress<'a> {
    reporter: &'a mut dyn ProgressReporter,
    total_units: u64,
    current_units: u64,
    last_percent: Option<u8>,
}

impl<'a> Progress<'a> {
    pub fn new(reporter: &'a mut dyn ProgressReporter) -> Self {
        Self {
            reporter,
            total_units: 0,
            current_units: 0,
            last_percent: None,
        }
    }

    /// Report 0% before any work happens.
    pub fn begin(&mut self) {
        self.emit(0);
    }

    /// Account `units` of upcoming work (plan pass).
    pub fn plan(&mut self, units: u64) {
        self.total_units += units;
    }

    /// Record `units` of completed work (execute pass).
    pub fn advance(&mut self, units: u64) {
        if self.total_units == 0 {
            return;
        }
        self.current_units = (self.current_units + units).min(self.total_units);
        // 100 is reserved for complete(), which runs after the sink closes.
        let percent = (self.current_units * 100 / self.total_units).min(99) as u8;
        self.emit(percent);
    }

    /// Report 100%.
    pub fn complete(&mut self) {
        self.emit(100);
    }

    fn emit(&mut self, percent: u8) {
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            self.reporter.report(percent);
        }
    }
}
