//! Consumption, cost and projection queries over a dataset snapshot.
//!
//! Pure functions: they read a [`Dataset`] and compute, never mutate. The
//! manager exposes the common ones as methods; report and dashboard
//! consumers call them read-only, formatting is theirs.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use store::{Dataset, Meter, MeterType, Reading, Tariff};

/// Days assumed per month when pro-rating a monthly base charge.
const DAYS_PER_MONTH: f64 = 30.0;

/// A meter joined with its type, if the type still exists.
#[derive(Clone, Debug, Serialize)]
pub struct MeterWithType {
    pub meter: Meter,
    pub meter_type: Option<MeterType>,
}

/// Optional closed or half-open time range.
#[derive(Clone, Copy, Debug, Default)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn all() -> Self {
        Self::default()
    }

    fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| t >= s) && self.end.map_or(true, |e| t <= e)
    }
}

/// Consumption between the first and last reading inside the range.
#[derive(Clone, Debug, Serialize)]
pub struct Consumption {
    pub consumption: f64,
    /// The readings the figure was computed from, sorted by timestamp.
    pub readings: Vec<Reading>,
    /// Actual span covered: first and last reading timestamps.
    pub period: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Cost of a meter's consumption under its assigned tariff.
#[derive(Clone, Debug, Serialize)]
pub struct CostBreakdown {
    pub cost: f64,
    pub usage_cost: f64,
    pub base_charge: f64,
    pub consumption: f64,
    pub tariff: Option<Tariff>,
    pub currency: String,
}

/// One month of a yearly breakdown.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MonthlySlice {
    pub month: u32,
    pub year: i32,
    pub consumption: f64,
    pub cost: f64,
    pub readings_count: usize,
}

pub fn readings_for_meter(data: &Dataset, meter_id: Uuid) -> Vec<Reading> {
    let mut readings: Vec<Reading> = data
        .readings
        .iter()
        .filter(|r| r.meter_id == meter_id)
        .cloned()
        .collect();
    readings.sort_by_key(|r| r.timestamp);
    readings
}

pub fn latest_reading(data: &Dataset, meter_id: Uuid) -> Option<Reading> {
    readings_for_meter(data, meter_id).into_iter().last()
}

pub fn meters_with_types(data: &Dataset) -> Vec<MeterWithType> {
    data.meters
        .iter()
        .map(|meter| MeterWithType {
            meter: meter.clone(),
            meter_type: data
                .meter_types
                .iter()
                .find(|mt| mt.id == meter.type_id)
                .cloned(),
        })
        .collect()
}

pub fn meters_in_group(data: &Dataset, group_id: Uuid) -> Vec<Meter> {
    data.meters
        .iter()
        .filter(|m| m.group_id == Some(group_id))
        .cloned()
        .collect()
}

pub fn ungrouped_meters(data: &Dataset) -> Vec<Meter> {
    data.meters
        .iter()
        .filter(|m| m.group_id.is_none())
        .cloned()
        .collect()
}

pub fn tariffs_for_meter_type(data: &Dataset, meter_type_id: Uuid) -> Vec<Tariff> {
    data.tariffs
        .iter()
        .filter(|t| t.meter_type_id == meter_type_id)
        .cloned()
        .collect()
}

/// The tariff assigned to the meter, if it is effective on the given date.
pub fn active_tariff_for_meter(data: &Dataset, meter_id: Uuid, on: NaiveDate) -> Option<Tariff> {
    let meter = data.meters.iter().find(|m| m.id == meter_id)?;
    let tariff_id = meter.tariff_id?;
    let tariff = data.tariffs.iter().find(|t| t.id == tariff_id)?;
    tariff.is_active_on(on).then(|| tariff.clone())
}

/// Consumption over a range: last reading value minus first. Fewer than two
/// readings in range means zero consumption.
pub fn calculate_consumption(data: &Dataset, meter_id: Uuid, range: &DateRange) -> Consumption {
    let readings: Vec<Reading> = readings_for_meter(data, meter_id)
        .into_iter()
        .filter(|r| range.contains(r.timestamp))
        .collect();

    if readings.len() < 2 {
        return Consumption {
            consumption: 0.0,
            readings,
            period: None,
        };
    }

    let first = &readings[0];
    let last = &readings[readings.len() - 1];
    Consumption {
        consumption: last.value - first.value,
        period: Some((first.timestamp, last.timestamp)),
        readings,
    }
}

/// Consumption cost over a range: usage times price per unit, plus the
/// monthly base charge pro-rated over the covered days.
pub fn calculate_cost(data: &Dataset, meter_id: Uuid, range: &DateRange) -> CostBreakdown {
    let currency = data.settings.currency.clone();
    let empty = |tariff: Option<Tariff>| CostBreakdown {
        cost: 0.0,
        usage_cost: 0.0,
        base_charge: 0.0,
        consumption: 0.0,
        tariff,
        currency: currency.clone(),
    };

    let Some(meter) = data.meters.iter().find(|m| m.id == meter_id) else {
        return empty(None);
    };
    let tariff = meter
        .tariff_id
        .and_then(|id| data.tariffs.iter().find(|t| t.id == id))
        .cloned();
    let Some(tariff) = tariff else {
        return empty(None);
    };

    let consumption = calculate_consumption(data, meter_id, range);
    let usage_cost = consumption.consumption * tariff.price_per_unit;

    let base_charge = match (tariff.base_charge > 0.0, consumption.period) {
        (true, Some((start, end))) => {
            let days = ((end - start).num_seconds() as f64 / 86_400.0).ceil();
            (tariff.base_charge / DAYS_PER_MONTH) * days
        }
        _ => 0.0,
    };

    CostBreakdown {
        cost: usage_cost + base_charge,
        usage_cost,
        base_charge,
        consumption: consumption.consumption,
        tariff: Some(tariff),
        currency,
    }
}

/// Twelve slices for a calendar year. Consumption between consecutive
/// readings is attributed to the month of the later reading; negative
/// deltas (meter resets) are skipped. The base charge lands on months that
/// saw consumption.
pub fn monthly_breakdown(data: &Dataset, meter_id: Uuid, year: i32) -> Vec<MonthlySlice> {
    let readings = readings_for_meter(data, meter_id);
    let tariff = data
        .meters
        .iter()
        .find(|m| m.id == meter_id)
        .and_then(|m| m.tariff_id)
        .and_then(|id| data.tariffs.iter().find(|t| t.id == id));

    let mut months: Vec<MonthlySlice> = (1..=12)
        .map(|month| MonthlySlice {
            month,
            year,
            consumption: 0.0,
            cost: 0.0,
            readings_count: 0,
        })
        .collect();

    for reading in &readings {
        if reading.timestamp.year() == year {
            months[reading.timestamp.month0() as usize].readings_count += 1;
        }
    }

    for pair in readings.windows(2) {
        let (prev, curr) = (&pair[0], &pair[1]);
        if curr.timestamp.year() != year {
            continue;
        }
        let delta = curr.value - prev.value;
        if delta < 0.0 {
            continue;
        }
        let slice = &mut months[curr.timestamp.month0() as usize];
        slice.consumption += delta;
        if let Some(tariff) = tariff {
            slice.cost += delta * tariff.price_per_unit;
        }
    }

    if let Some(tariff) = tariff {
        if tariff.base_charge > 0.0 {
            for slice in months.iter_mut().filter(|s| s.consumption > 0.0) {
                slice.cost += tariff.base_charge;
            }
        }
    }

    months
}

/// Consumption forecasting from historical readings.
pub mod forecast {
    use super::*;

    /// How much to trust a projection, graded from sample count and span.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
    pub enum Confidence {
        Low,
        Medium,
        High,
    }

    #[derive(Clone, Debug, Serialize)]
    pub struct UsageProjection {
        pub daily: f64,
        pub weekly: f64,
        pub monthly: f64,
        pub annual: f64,
        pub confidence: Confidence,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
    pub enum TrendDirection {
        Increasing,
        Decreasing,
        Stable,
        InsufficientData,
    }

    #[derive(Clone, Debug, Serialize)]
    pub struct TrendAnalysis {
        pub direction: TrendDirection,
        /// Absolute change between the two halves, in percent.
        pub percentage: f64,
        pub first_period_rate: f64,
        pub second_period_rate: f64,
    }

    #[derive(Clone, Debug, Serialize)]
    pub struct ProjectedReading {
        pub value: f64,
        pub confidence: Confidence,
    }

    fn sorted(readings: &[Reading]) -> Vec<Reading> {
        let mut sorted = readings.to_vec();
        sorted.sort_by_key(|r| r.timestamp);
        sorted
    }

    fn span_days(readings: &[Reading]) -> f64 {
        match (readings.first(), readings.last()) {
            (Some(first), Some(last)) => {
                (last.timestamp - first.timestamp).num_seconds() as f64 / 86_400.0
            }
            _ => 0.0,
        }
    }

    /// Average consumption per day over the full reading span. Zero when
    /// fewer than two readings exist or the span is empty.
    pub fn average_daily_consumption(readings: &[Reading]) -> f64 {
        if readings.len() < 2 {
            return 0.0;
        }
        let sorted = sorted(readings);
        let days = span_days(&sorted);
        if days <= 0.0 {
            return 0.0;
        }
        let total = sorted[sorted.len() - 1].value - sorted[0].value;
        total / days
    }

    fn confidence(readings: &[Reading]) -> Confidence {
        let sorted = sorted(readings);
        let days = span_days(&sorted);
        if sorted.len() >= 6 && days >= 60.0 {
            Confidence::High
        } else if sorted.len() >= 3 && days >= 14.0 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    /// Project usage per day/week/month/year from the current daily rate.
    pub fn project_annual_usage(readings: &[Reading]) -> UsageProjection {
        let daily = average_daily_consumption(readings);
        UsageProjection {
            daily,
            weekly: daily * 7.0,
            // Average Gregorian month length.
            monthly: daily * 30.44,
            annual: daily * 365.0,
            confidence: confidence(readings),
        }
    }

    /// Compare the daily rate of the older half against the newer half.
    /// A change beyond 10 % in either direction counts as a trend.
    pub fn analyze_trend(readings: &[Reading]) -> TrendAnalysis {
        if readings.len() < 4 {
            return TrendAnalysis {
                direction: TrendDirection::InsufficientData,
                percentage: 0.0,
                first_period_rate: 0.0,
                second_period_rate: 0.0,
            };
        }

        let sorted = sorted(readings);
        let midpoint = sorted.len() / 2;
        let first_period_rate = average_daily_consumption(&sorted[..midpoint]);
        let second_period_rate = average_daily_consumption(&sorted[midpoint..]);

        if first_period_rate == 0.0 {
            return TrendAnalysis {
                direction: TrendDirection::Stable,
                percentage: 0.0,
                first_period_rate,
                second_period_rate,
            };
        }

        let change = (second_period_rate - first_period_rate) / first_period_rate * 100.0;
        let direction = if change > 10.0 {
            TrendDirection::Increasing
        } else if change < -10.0 {
            TrendDirection::Decreasing
        } else {
            TrendDirection::Stable
        };

        TrendAnalysis {
            direction,
            percentage: change.abs(),
            first_period_rate,
            second_period_rate,
        }
    }

    /// Extrapolate the meter value at `target` from the last reading and the
    /// average daily rate. `None` with fewer than two readings.
    pub fn project_reading(
        readings: &[Reading],
        target: DateTime<Utc>,
    ) -> Option<ProjectedReading> {
        if readings.len() < 2 {
            return None;
        }
        let sorted = sorted(readings);
        let last = &sorted[sorted.len() - 1];
        let daily = average_daily_consumption(&sorted);
        let days_ahead = (target - last.timestamp).num_seconds() as f64 / 86_400.0;
        Some(ProjectedReading {
            value: last.value + daily * days_ahead,
            confidence: confidence(&sorted),
        })
    }
}
