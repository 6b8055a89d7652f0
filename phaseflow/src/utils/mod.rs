//! Date partition and timestamp helpers.

pub mod dates;

pub use dates::{end_of_day, iso_timestamp, parse_date, start_of_day, DateRange, Timestamp};
