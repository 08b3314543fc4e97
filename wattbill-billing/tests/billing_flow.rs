mod common;

use std::sync::Arc;

use anyhow::Result;
use rust_decimal_macros::dec;
use tempfile::tempdir;
use wattbill_billing::BillingError;
use wattbill_core::{Allocation, MonetaryItems};
use wattbill_events::EventBus;
use wattbill_ledger::{LedgerQuery, Registry};

use common::*;

#[test]
fn accepted_bill_advances_meter_and_fills_ledger() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path());
    let march = period(3, 2024);

    let accepted = service.submit_bill(submission(
        SINGLE,
        march,
        dec!(1000),
        dec!(1050),
        dec!(50),
        dec!(105),
    ))?;

    assert_eq!(accepted.bill.computed_total, dec!(105));
    assert_eq!(accepted.bill.tariff_cost, dec!(2.00));
    assert_eq!(accepted.allocations.len(), 1);
    assert_eq!(accepted.allocations[0].percentage, Some(dec!(100)));
    assert_eq!(final_reading(service.repository(), SINGLE), dec!(1050));

    let ledger = ledger(service.repository(), key(NORTH, FILTRATION, march)).unwrap();
    assert_eq!(ledger.allocation, Allocation::full());
    assert_eq!(ledger.power, dec!(50));
    assert_eq!(ledger.bill_total, dec!(105));
    assert!(ledger.water_amount.is_none());
    Ok(())
}

#[test]
fn consecutive_months_chain_readings() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path());
    service.submit_bill(submission(
        SINGLE,
        period(3, 2024),
        dec!(1000),
        dec!(1050),
        dec!(50),
        dec!(105),
    ))?;
    service.submit_bill(submission(
        SINGLE,
        period(4, 2024),
        dec!(1050),
        dec!(1080),
        dec!(30),
        dec!(65),
    ))?;

    assert_eq!(final_reading(service.repository(), SINGLE), dec!(1080));
    let ledgers = service.ledgers(&LedgerQuery::default().with_station(NORTH))?;
    assert_eq!(ledgers.len(), 2);
    assert_eq!(ledgers[1].power, dec!(30));
    Ok(())
}

#[test]
fn reading_mismatch_leaves_state_untouched() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path());
    let march = period(3, 2024);

    let err = service
        .submit_bill(submission(
            SINGLE,
            march,
            dec!(999),
            dec!(1050),
            dec!(51),
            dec!(107),
        ))
        .unwrap_err();
    match err {
        BillingError::ReadingMismatch {
            expected,
            submitted,
            ..
        } => {
            assert_eq!(expected, dec!(1000));
            assert_eq!(submitted, dec!(999));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(final_reading(service.repository(), SINGLE), dec!(1000));
    assert!(service.bill(&account(SINGLE), march)?.is_none());
    assert!(service.ledgers(&LedgerQuery::default())?.is_empty());
    Ok(())
}

#[test]
fn factor_mismatch_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path());
    let mut entry = submission(
        SINGLE,
        period(3, 2024),
        dec!(1000),
        dec!(1050),
        dec!(50),
        dec!(205),
    );
    entry.reading_factor = 2;
    let err = service.submit_bill(entry).unwrap_err();
    assert!(
        matches!(
            err,
            BillingError::FactorMismatch {
                expected: 1,
                submitted: 2
            }
        ),
        "{err:?}"
    );
    assert_eq!(final_reading(service.repository(), SINGLE), dec!(1000));
    Ok(())
}

#[test]
fn total_outside_tolerance_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path());
    let march = period(3, 2024);

    let err = service
        .submit_bill(submission(
            SINGLE,
            march,
            dec!(1000),
            dec!(1050),
            dec!(50),
            dec!(110),
        ))
        .unwrap_err();
    assert!(matches!(err, BillingError::TotalMismatch { .. }), "{err:?}");
    assert_eq!(final_reading(service.repository(), SINGLE), dec!(1000));

    let accepted = service.submit_bill(submission(
        SINGLE,
        march,
        dec!(1000),
        dec!(1050),
        dec!(50),
        dec!(104),
    ))?;
    assert_eq!(accepted.bill.bill_total, dec!(104));
    assert_eq!(accepted.bill.computed_total, dec!(105));
    Ok(())
}

#[test]
fn monetary_items_enter_the_total() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path());
    let mut entry = submission(
        SINGLE,
        period(3, 2024),
        dec!(1000),
        dec!(1050),
        dec!(50),
        dec!(96),
    );
    entry.items = MonetaryItems {
        fixed_installment: dec!(10),
        stamp: dec!(1),
        prior_payments: dec!(20),
        ..MonetaryItems::default()
    };
    let accepted = service.submit_bill(entry)?;
    assert_eq!(accepted.bill.computed_total, dec!(96));
    Ok(())
}

#[test]
fn unlinked_meter_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path());
    let err = service
        .submit_bill(submission(
            LONE,
            period(3, 2024),
            dec!(0),
            dec!(10),
            dec!(10),
            dec!(25),
        ))
        .unwrap_err();
    assert!(matches!(err, BillingError::NotLinked(_)), "{err:?}");
    Ok(())
}

#[test]
fn deactivated_relation_no_longer_links_meter() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path());
    service
        .repository()
        .unlink(NORTH, FILTRATION, &account(SINGLE))?;
    let err = service
        .submit_bill(submission(
            SINGLE,
            period(3, 2024),
            dec!(1000),
            dec!(1050),
            dec!(50),
            dec!(105),
        ))
        .unwrap_err();
    assert!(matches!(err, BillingError::NotLinked(_)), "{err:?}");
    Ok(())
}

#[test]
fn counter_rollover_is_accepted() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path());
    let accepted = service.submit_bill(submission(
        ROLLOVER,
        period(3, 2024),
        dec!(9998),
        dec!(3),
        dec!(4),
        dec!(13),
    ))?;
    assert_eq!(accepted.bill.consumption_cost, dec!(8.00));
    assert_eq!(final_reading(service.repository(), ROLLOVER), dec!(3));
    Ok(())
}

#[test]
fn duplicate_period_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path());
    let march = period(3, 2024);
    service.submit_bill(submission(
        SINGLE,
        march,
        dec!(1000),
        dec!(1050),
        dec!(50),
        dec!(105),
    ))?;
    let err = service
        .submit_bill(submission(
            SINGLE,
            march,
            dec!(1050),
            dec!(1100),
            dec!(50),
            dec!(105),
        ))
        .unwrap_err();
    assert!(matches!(err, BillingError::Integrity(_)), "{err:?}");
    assert_eq!(final_reading(service.repository(), SINGLE), dec!(1050));
    Ok(())
}

#[test]
fn invalid_month_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path());
    let mut entry = submission(
        SINGLE,
        period(3, 2024),
        dec!(1000),
        dec!(1050),
        dec!(50),
        dec!(105),
    );
    entry.period.month = 13;
    let err = service.submit_bill(entry).unwrap_err();
    assert!(matches!(err, BillingError::InvalidPeriod(_)), "{err:?}");
    Ok(())
}

#[test]
fn deleting_a_bill_restores_prior_state() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path());
    let march = period(3, 2024);
    service.submit_bill(submission(
        SINGLE,
        march,
        dec!(1000),
        dec!(1050),
        dec!(50),
        dec!(105),
    ))?;

    let reversed = service.delete_bill(&account(SINGLE), march)?;

    assert_eq!(reversed.restored_reading, dec!(1000));
    assert_eq!(reversed.removed_ledgers, vec![key(NORTH, FILTRATION, march)]);
    assert_eq!(final_reading(service.repository(), SINGLE), dec!(1000));
    assert!(service.bill(&account(SINGLE), march)?.is_none());
    assert!(service.allocations(&account(SINGLE), march)?.is_empty());
    assert!(service.ledgers(&LedgerQuery::default())?.is_empty());

    // The same reading can be submitted again.
    service.submit_bill(submission(
        SINGLE,
        march,
        dec!(1000),
        dec!(1050),
        dec!(50),
        dec!(105),
    ))?;
    Ok(())
}

#[test]
fn only_the_latest_bill_can_be_deleted() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path());
    let march = period(3, 2024);
    let april = period(4, 2024);
    service.submit_bill(submission(
        SINGLE,
        march,
        dec!(1000),
        dec!(1050),
        dec!(50),
        dec!(105),
    ))?;
    service.submit_bill(submission(
        SINGLE,
        april,
        dec!(1050),
        dec!(1080),
        dec!(30),
        dec!(65),
    ))?;

    let err = service.delete_bill(&account(SINGLE), march).unwrap_err();
    assert!(matches!(err, BillingError::NotLatestBill { .. }), "{err:?}");

    service.delete_bill(&account(SINGLE), april)?;
    service.delete_bill(&account(SINGLE), march)?;
    assert_eq!(final_reading(service.repository(), SINGLE), dec!(1000));
    Ok(())
}

#[test]
fn zero_consumption_month_keeps_the_earlier_bill_locked() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path());
    let march = period(3, 2024);
    let april = period(4, 2024);
    service.submit_bill(submission(
        SINGLE,
        march,
        dec!(1000),
        dec!(1050),
        dec!(50),
        dec!(105),
    ))?;
    // April ends on the reading March ended on.
    service.submit_bill(submission(
        SINGLE,
        april,
        dec!(1050),
        dec!(1050),
        dec!(0),
        dec!(5),
    ))?;

    let err = service.delete_bill(&account(SINGLE), march).unwrap_err();
    assert!(matches!(err, BillingError::NotLatestBill { .. }), "{err:?}");
    assert_eq!(final_reading(service.repository(), SINGLE), dec!(1050));
    assert!(service.bill(&account(SINGLE), march)?.is_some());
    let march_ledger = ledger(service.repository(), key(NORTH, FILTRATION, march)).unwrap();
    assert_eq!(march_ledger.power, dec!(50));

    let reversed = service.delete_bill(&account(SINGLE), april)?;
    assert_eq!(reversed.restored_reading, dec!(1050));
    service.delete_bill(&account(SINGLE), march)?;
    assert_eq!(final_reading(service.repository(), SINGLE), dec!(1000));
    assert!(service.ledgers(&LedgerQuery::default())?.is_empty());
    Ok(())
}

#[test]
fn deleting_a_missing_bill_fails() -> Result<()> {
    let dir = tempdir()?;
    let service = service(dir.path());
    let err = service
        .delete_bill(&account(SINGLE), period(3, 2024))
        .unwrap_err();
    assert!(matches!(err, BillingError::BillNotFound { .. }), "{err:?}");
    Ok(())
}

#[test]
fn events_follow_committed_operations() -> Result<()> {
    let dir = tempdir()?;
    let bus = Arc::new(EventBus::new(16));
    let mut stream = bus.subscribe();
    let service = service(dir.path()).with_events(bus);
    let march = period(3, 2024);

    let _ = service.submit_bill(submission(
        SINGLE,
        march,
        dec!(999),
        dec!(1050),
        dec!(51),
        dec!(107),
    ));
    assert!(stream.try_recv().is_err(), "rejected submissions publish nothing");

    service.submit_bill(submission(
        SINGLE,
        march,
        dec!(1000),
        dec!(1050),
        dec!(50),
        dec!(105),
    ))?;
    assert_eq!(stream.try_recv()?.event.kind(), "bill_accepted");

    service.delete_bill(&account(SINGLE), march)?;
    assert_eq!(stream.try_recv()?.event.kind(), "bill_reversed");
    Ok(())
}
