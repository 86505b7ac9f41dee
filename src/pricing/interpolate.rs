//! Daily series reconstruction from sparse observations (trade prices/rates).

use crate::domain::{Decimal, Trade};
use chrono::NaiveDate;

/// One observation per date, first trade of each day wins, ordered by date.
pub fn observations<F>(trades: &[&Trade], value: F) -> Vec<(NaiveDate, Decimal)>
where
    F: Fn(&Trade) -> Decimal,
{
    let mut sorted: Vec<&&Trade> = trades.iter().collect();
    sorted.sort_by_key(|t| t.trade_time);

    let mut points: Vec<(NaiveDate, Decimal)> = Vec::with_capacity(sorted.len());
    for trade in sorted {
        let date = trade.trade_date();
        if points.last().map(|(d, _)| *d) != Some(date) {
            points.push((date, value(trade)));
        }
    }
    points
}

/// Fill every calendar day from the first observation through `end`:
/// linear between consecutive observations, flat after the last one.
pub fn daily_series(points: &[(NaiveDate, Decimal)], end: NaiveDate) -> Vec<(NaiveDate, Decimal)> {
    let mut series = Vec::new();
    for (i, &(date, value)) in points.iter().enumerate() {
        series.push((date, value));
        match points.get(i + 1) {
            Some(&(next_date, next_value)) => {
                let span = (next_date - date).num_days();
                for step in 1..span {
                    let fraction = Decimal::from(step) / Decimal::from(span);
                    let interpolated = value + (next_value - value) * fraction;
                    series.push((date + chrono::Duration::days(step), interpolated));
                }
            }
            None => {
                let mut day = date;
                while let Some(next) = day.succ_opt() {
                    if next > end {
                        break;
                    }
                    series.push((next, value));
                    day = next;
                }
            }
        }
    }
    series
}
