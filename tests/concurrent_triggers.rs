//! Scheduler tick and injector drain racing on the same recipient.
//!
//! Both triggers share one `RecipientLocks`, so exactly one of them may use
//! the last slot under the daily cap.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use sms_cadence::catalog::{MessageTemplate, category};
use sms_cadence::clock;
use sms_cadence::config::{InjectorConfig, SchedulerConfig};
use sms_cadence::delivery::{DeliveryRecord, Dispatcher, Scheduler, SendPolicy};
use sms_cadence::event_log::EventLog;
use sms_cadence::injector::{InjectRequest, Injector};
use sms_cadence::phone::PhoneNumber;
use sms_cadence::recipients::{Recipient, RecipientClass, RecipientLocks};
use sms_cadence::store::{Database, LibSqlBackend};
use sms_cadence::transport::MemoryTransport;

/// Wednesday 2026-05-06, 12:00 Chicago.
fn wednesday_noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 6, 17, 0, 0).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tick_and_injection_share_the_last_daily_slot() {
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let transport = Arc::new(MemoryTransport::new());
    let locks = Arc::new(RecipientLocks::new());
    let log = EventLog::new(Arc::clone(&store));
    let now = wednesday_noon();

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        transport.clone(),
        SendPolicy::default(),
        log.clone(),
        Duration::from_secs(5),
    ));
    let scheduler = Arc::new(
        Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&locks),
            log.clone(),
            SchedulerConfig {
                recipient_delay: Duration::ZERO,
                ..SchedulerConfig::default()
            },
        )
        .with_clock(clock::fixed(now)),
    );
    let injector = Arc::new(
        Injector::new(
            Arc::clone(&store),
            dispatcher,
            locks,
            log,
            InjectorConfig::default(),
        )
        .with_clock(clock::fixed(now)),
    );

    store
        .upsert_template(
            &MessageTemplate::new("seq_1", "Elevate", category::SEQUENCE, "Day one").numbered(1),
        )
        .await
        .unwrap();
    let r = Recipient::enroll(
        PhoneNumber::parse("5551234567").unwrap(),
        "Elevate",
        RecipientClass::Subscriber,
        chrono_tz::America::Chicago,
        now - chrono::Duration::days(1),
    );
    store.upsert_recipient(&r).await.unwrap();

    // Three manual sends earlier today leave one slot under the cap of 4.
    let today = r.local_date(now);
    for i in 0..3 {
        let earlier = now - chrono::Duration::hours(3 - i);
        let record = DeliveryRecord::sent(&r.phone, "earlier", 1, true, format!("SM{i}"), earlier);
        store.record_send(&record, today, None).await.unwrap();
    }

    let tick = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.run_tick().await }
    });
    let inject = tokio::spawn({
        let injector = Arc::clone(&injector);
        async move {
            injector
                .inject(InjectRequest {
                    body: "Storm warning".into(),
                    template_id: "storm_1".into(),
                    priority: 9,
                    program: None,
                    options: None,
                })
                .await
        }
    });
    let summary = tick.await.unwrap();
    let report = inject.await.unwrap().unwrap();

    assert_eq!(summary.sent + report.sent, 1);
    assert_eq!(summary.skipped + report.skipped, 1);
    assert_eq!(transport.sent_to(&r.phone).len(), 1);
    assert_eq!(store.get_daily_count(&r.phone, today).await.unwrap(), 4);

    let stored = store.get_recipient(&r.phone).await.unwrap().unwrap();
    if summary.sent == 1 {
        assert_eq!(stored.sequence_position, 2);
        assert_eq!(transport.sent_to(&r.phone)[0].template_id, "seq_1");
    } else {
        assert_eq!(stored.sequence_position, 1);
        assert_eq!(transport.sent_to(&r.phone)[0].template_id, "storm_1");
    }
}
