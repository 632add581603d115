use crate::application::billing::UnitPosition;
use crate::domain::reservation::Reservation;
use crate::domain::{AssetId, OrgId, UnitId};
use crate::error::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize)]
struct PositionRow {
    org: OrgId,
    unit: UnitId,
    outstanding: Decimal,
    penalties: Decimal,
    credit: Decimal,
}

#[derive(Debug, Serialize)]
struct ReservationRow<'a> {
    reservation: &'a str,
    asset: AssetId,
    status: String,
    payment: String,
    paid: Decimal,
}

/// Writes end-of-run state as CSV.
pub struct SummaryWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> SummaryWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    /// One `org,unit,outstanding,penalties,credit` row per unit.
    pub fn write_positions(&mut self, org_id: OrgId, positions: &[UnitPosition]) -> Result<()> {
        for position in positions {
            self.writer.serialize(PositionRow {
                org: org_id,
                unit: position.unit_id,
                outstanding: money(position.outstanding.value()),
                penalties: money(position.pending_penalties),
                credit: money(position.credit.value()),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }

    /// One `reservation,asset,status,payment,paid` row per labelled
    /// reservation.
    pub fn write_reservations<'a, I>(&mut self, reservations: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a Reservation)>,
    {
        for (label, reservation) in reservations {
            self.writer.serialize(ReservationRow {
                reservation: label,
                asset: reservation.asset_id,
                status: reservation.status.to_string(),
                payment: reservation.payment_status.to_string(),
                paid: money(reservation.amount_paid),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

fn money(value: Decimal) -> Decimal {
    value.round_dp(2).normalize()
}
