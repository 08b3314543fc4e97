use wattbill_core::{Period, StationId, TechnologyId};

/// Filter describing which technology ledgers to load from storage.
#[derive(Clone, Debug)]
pub struct LedgerQuery {
    pub period: Option<Period>,
    pub station: Option<StationId>,
    pub technology: Option<TechnologyId>,
    pub limit: Option<usize>,
    pub ascending: bool,
}

impl Default for LedgerQuery {
    fn default() -> Self {
        Self {
            period: None,
            station: None,
            technology: None,
            limit: None,
            ascending: true,
        }
    }
}

impl LedgerQuery {
    pub fn with_period(mut self, period: Period) -> Self {
        self.period = Some(period);
        self
    }

    pub fn with_station(mut self, station: StationId) -> Self {
        self.station = Some(station);
        self
    }

    pub fn with_technology(mut self, technology: TechnologyId) -> Self {
        self.technology = Some(technology);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn descending(mut self) -> Self {
        self.ascending = false;
        self
    }
}
