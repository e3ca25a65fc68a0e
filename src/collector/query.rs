//! Collection query parameters and validation.

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

use crate::transport::EntityRef;

/// Entities collectable per query for unprivileged callers.
pub const MAX_ENTITIES_PER_QUERY: usize = 25;

/// Rejected query parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("you must provide at least one entity to collect")]
    NoEntities,

    #[error("you cannot collect more than {MAX_ENTITIES_PER_QUERY} entities at a time (got {0})")]
    TooManyEntities(usize),

    #[error("the minimum date must not be after the maximum date")]
    InvalidDateRange,

    #[error("messages per entity must be positive")]
    InvalidItemLimit,
}

/// Parameters for one collection run.
#[derive(Debug, Clone)]
pub struct CollectionQuery {
    /// Entities to collect, in request order, without duplicates.
    pub entities: Vec<EntityRef>,
    /// Lower stop bound as epoch seconds: pagination stops at the first
    /// message older than this.
    pub min_date: Option<i64>,
    /// Upper offset bound: no message newer than this is fetched. In
    /// continuous mode this doubles as the collection end time.
    pub max_date: Option<DateTime<Utc>>,
    /// Accepted records per entity, and the flush threshold in
    /// continuous mode.
    pub max_items_per_entity: usize,
    /// Resolve embedded peer/channel/user references via extra lookups.
    pub resolve_references: bool,
    /// Keep non-message events (joins, pins, title changes).
    pub include_non_message_events: bool,
    /// Follow linked discussion channels discovered during collection.
    pub retrieve_linked_replies: bool,
    /// Keep listening for new messages after the historical backfill.
    pub continuous: bool,
}

impl CollectionQuery {
    pub fn new(entities: Vec<EntityRef>) -> Self {
        Self {
            entities,
            min_date: None,
            max_date: None,
            max_items_per_entity: 10,
            resolve_references: false,
            include_non_message_events: false,
            retrieve_linked_replies: false,
            continuous: false,
        }
    }

    /// Parse a free-form entity list, separated by commas or line breaks.
    ///
    /// Each item is sanitized through [`EntityRef::parse`]; duplicates are
    /// removed while keeping the first occurrence's position.
    pub fn parse_entities(raw: &str) -> Vec<EntityRef> {
        let mut entities: Vec<EntityRef> = Vec::new();
        for item in raw.replace('\n', ",").split(',') {
            if let Some(entity) = EntityRef::parse(item) {
                if !entities.contains(&entity) {
                    entities.push(entity);
                }
            }
        }
        entities
    }

    /// Set the date window from epoch seconds.
    ///
    /// The maximum is widened to the end of its calendar day, so a range
    /// given as dates includes the last day fully.
    pub fn with_date_range(mut self, min_date: Option<i64>, max_date: Option<i64>) -> Self {
        self.min_date = min_date;
        self.max_date = max_date
            .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
            .and_then(|dt| dt.date_naive().and_hms_opt(23, 59, 59))
            .map(|naive| Utc.from_utc_datetime(&naive));
        self
    }

    /// Validate the query. `privileged` lifts the entity-count cap.
    pub fn validate(&self, privileged: bool) -> Result<(), QueryError> {
        if self.entities.is_empty() {
            return Err(QueryError::NoEntities);
        }
        if !privileged && self.entities.len() > MAX_ENTITIES_PER_QUERY {
            return Err(QueryError::TooManyEntities(self.entities.len()));
        }
        if self.max_items_per_entity == 0 {
            return Err(QueryError::InvalidItemLimit);
        }
        if let (Some(min), Some(max)) = (self.min_date, self.max_date) {
            if min > max.timestamp() {
                return Err(QueryError::InvalidDateRange);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entities_mixed_separators() {
        let entities =
            CollectionQuery::parse_entities("alpha, https://t.me/beta\n-100123,  ,alpha");
        assert_eq!(
            entities,
            vec![
                EntityRef::Username("alpha".to_string()),
                EntityRef::Username("beta".to_string()),
                EntityRef::NumericId(-100123),
            ]
        );
    }

    #[test]
    fn test_validate_requires_entities() {
        let query = CollectionQuery::new(vec![]);
        assert_eq!(query.validate(false), Err(QueryError::NoEntities));
    }

    #[test]
    fn test_validate_entity_cap() {
        let entities: Vec<EntityRef> = (0..26).map(EntityRef::NumericId).collect();
        let query = CollectionQuery::new(entities);
        assert_eq!(query.validate(false), Err(QueryError::TooManyEntities(26)));
        // privileged users may exceed the cap
        assert_eq!(query.validate(true), Ok(()));
    }

    #[test]
    fn test_validate_item_limit() {
        let mut query = CollectionQuery::new(vec![EntityRef::NumericId(1)]);
        query.max_items_per_entity = 0;
        assert_eq!(query.validate(false), Err(QueryError::InvalidItemLimit));
    }

    #[test]
    fn test_validate_date_range() {
        let query = CollectionQuery::new(vec![EntityRef::NumericId(1)])
            .with_date_range(Some(2_000_000_000), Some(1_000_000_000));
        assert_eq!(query.validate(false), Err(QueryError::InvalidDateRange));

        let query = CollectionQuery::new(vec![EntityRef::NumericId(1)])
            .with_date_range(Some(1_000_000_000), Some(2_000_000_000));
        assert_eq!(query.validate(false), Ok(()));
    }

    #[test]
    fn test_max_date_widens_to_end_of_day() {
        let query = CollectionQuery::new(vec![EntityRef::NumericId(1)])
            .with_date_range(None, Some(1_650_000_000));
        let max = query.max_date.unwrap();
        assert_eq!(max.format("%H:%M:%S").to_string(), "23:59:59");
    }
}
