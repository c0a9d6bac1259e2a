use super::*;
use super::conflict::{check_no_overlap, now_ms, validate_span};
use crate::limits::*;
use crate::model::*;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms
const T: Ms = 1_700_000_000_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("scopetime_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), Arc::new(NotifyHub::new()), QuotaPolicy::default()).unwrap()
}

fn roles(list: &[Role]) -> RoleSet {
    list.iter().copied().collect()
}

fn new_appt(telescope_id: Ulid, user_id: Ulid, start: Ms, end: Ms) -> NewAppointment {
    NewAppointment {
        id: Ulid::new(),
        telescope_id,
        user_id,
        span: Span::new(start, end),
        priority: Priority::Primary,
        kind: AppointmentType::Point,
        public: true,
    }
}

/// One telescope, one user with the given cap.
async fn setup(name: &str, cap: AllottedTime) -> (Engine, Ulid, Ulid) {
    let engine = engine(name);
    let telescope = Ulid::new();
    engine.create_telescope(telescope, Some("Dish".into())).await.unwrap();
    let user = Ulid::new();
    engine.register_user(user, None, roles(&[Role::User])).await.unwrap();
    engine.set_allotted_time(user, cap).await.unwrap();
    (engine, telescope, user)
}

async fn status_of(engine: &Engine, id: Ulid) -> AppointmentStatus {
    engine.get_appointment(id).await.unwrap().status
}

// ── Pure overlap helpers ─────────────────────────────────

fn telescope_with(appointments: Vec<Appointment>) -> TelescopeState {
    let mut ts = TelescopeState::new(Ulid::new(), None);
    for a in appointments {
        ts.insert_appointment(a);
    }
    ts
}

#[test]
fn overlap_ignores_canceled_and_excluded() {
    let live = new_appt(Ulid::new(), Ulid::new(), T, T + 50_000)
        .into_appointment(AppointmentStatus::Scheduled);
    let canceled = new_appt(Ulid::new(), Ulid::new(), T + 50_000, T + 90_000)
        .into_appointment(AppointmentStatus::Canceled);
    let live_id = live.id;
    let ts = telescope_with(vec![live, canceled]);

    assert_eq!(find_overlap(&ts, &Span::new(T + 10_000, T + 20_000), None), Some(live_id));
    assert!(!has_overlap(&ts, &Span::new(T + 60_000, T + 70_000), None));
    assert!(!has_overlap(&ts, &Span::new(T, T + 55_000), Some(live_id)));
    assert!(matches!(
        check_no_overlap(&ts, &Span::new(T - 5_000, T + 1), None),
        Err(EngineError::Overlap(id)) if id == live_id
    ));
}

#[test]
fn validate_window_bounds() {
    assert!(validate_window(T, T + H).is_ok());
    assert!(matches!(validate_window(T, T), Err(EngineError::Invalid(_))));
    assert!(matches!(validate_window(T + 1, T), Err(EngineError::Invalid(_))));
    assert!(matches!(
        validate_window(0, 1_000),
        Err(EngineError::LimitExceeded("timestamp out of range"))
    ));
    assert!(matches!(
        validate_span(&Span::new(T, T + MAX_WINDOW_DURATION_MS + 1)),
        Err(EngineError::LimitExceeded("window too long"))
    ));
}

// ── Telescopes and users ─────────────────────────────────

#[tokio::test]
async fn create_and_list_telescopes() {
    let engine = engine("list_telescopes.wal");
    let a = Ulid::new();
    let b = Ulid::new();
    engine.create_telescope(a, Some("North".into())).await.unwrap();
    engine.create_telescope(b, None).await.unwrap();

    let list = engine.list_telescopes().await;
    assert_eq!(list.len(), 2);
    assert!(list.iter().any(|t| t.id == a && t.name.as_deref() == Some("North")));
    assert!(matches!(
        engine.create_telescope(a, None).await,
        Err(EngineError::AlreadyExists(id)) if id == a
    ));
}

#[tokio::test]
async fn telescope_name_too_long() {
    let engine = engine("telescope_name.wal");
    let result = engine
        .create_telescope(Ulid::new(), Some("x".repeat(MAX_NAME_LEN + 1)))
        .await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn register_user_twice_rejected() {
    let engine = engine("user_twice.wal");
    let user = Ulid::new();
    engine.register_user(user, Some("vera".into()), roles(&[Role::Student])).await.unwrap();
    assert!(matches!(
        engine.register_user(user, None, RoleSet::new()).await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert_eq!(engine.get_user(&user).unwrap().name.as_deref(), Some("vera"));
}

#[tokio::test]
async fn delete_telescope_with_live_appointment_fails() {
    let (engine, telescope, user) = setup("delete_busy.wal", AllottedTime::Unlimited).await;
    let new = new_appt(telescope, user, T, T + H);
    let id = new.id;
    engine.create_appointment(new).await.unwrap();

    assert!(matches!(
        engine.delete_telescope(telescope).await,
        Err(EngineError::HasAppointments(_))
    ));

    engine.cancel_appointment(id).await.unwrap();
    engine.delete_telescope(telescope).await.unwrap();
    assert!(engine.get_telescope(&telescope).is_none());
    assert!(engine.get_appointment(id).await.is_none());
    assert!(engine.locate_appointment(&id).is_none());
}

#[tokio::test]
async fn delete_unknown_telescope() {
    let engine = engine("delete_unknown.wal");
    assert!(matches!(
        engine.delete_telescope(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Overlap ──────────────────────────────────────────────

#[tokio::test]
async fn overlapping_appointment_rejected() {
    let (engine, telescope, user) = setup("overlap.wal", AllottedTime::Unlimited).await;
    let first = new_appt(telescope, user, T, T + 50_000);
    let first_id = first.id;
    engine.create_appointment(first).await.unwrap();

    let clash = new_appt(telescope, user, T + 20_000, T + 70_000);
    let clash_id = clash.id;
    assert!(matches!(
        engine.create_appointment(clash).await,
        Err(EngineError::Overlap(id)) if id == first_id
    ));
    assert!(engine.get_appointment(clash_id).await.is_none());
    assert!(engine.has_overlap(telescope, Span::new(T + 49_999, T + 60_000), None).await);
}

#[tokio::test]
async fn back_to_back_windows_do_not_overlap() {
    let (engine, telescope, user) = setup("back_to_back.wal", AllottedTime::Unlimited).await;
    engine.create_appointment(new_appt(telescope, user, T, T + 50_000)).await.unwrap();

    // Touching at either edge is fine.
    engine
        .create_appointment(new_appt(telescope, user, T + 50_000, T + 90_000))
        .await
        .unwrap();
    engine
        .create_appointment(new_appt(telescope, user, T - 30_000, T))
        .await
        .unwrap();
    assert_eq!(engine.appointments_for_telescope(telescope).await.len(), 3);
}

#[tokio::test]
async fn other_telescope_does_not_conflict() {
    let (engine, telescope, user) = setup("other_telescope.wal", AllottedTime::Unlimited).await;
    let second = Ulid::new();
    engine.create_telescope(second, None).await.unwrap();

    engine.create_appointment(new_appt(telescope, user, T, T + H)).await.unwrap();
    engine.create_appointment(new_appt(second, user, T, T + H)).await.unwrap();
}

#[tokio::test]
async fn canceled_window_is_free_again() {
    let (engine, telescope, user) = setup("canceled_free.wal", AllottedTime::Unlimited).await;
    let first = new_appt(telescope, user, T, T + H);
    let first_id = first.id;
    engine.create_appointment(first).await.unwrap();
    engine.cancel_appointment(first_id).await.unwrap();

    engine.create_appointment(new_appt(telescope, user, T, T + H)).await.unwrap();
}

#[tokio::test]
async fn requested_appointment_blocks_window() {
    let (engine, telescope, user) = setup("requested_blocks.wal", AllottedTime::Unlimited).await;
    engine.request_appointment(new_appt(telescope, user, T, T + H)).await.unwrap();
    assert!(matches!(
        engine.create_appointment(new_appt(telescope, user, T + 30 * M, T + 2 * H)).await,
        Err(EngineError::Overlap(_))
    ));
}

#[tokio::test]
async fn overlap_query_on_unknown_telescope() {
    let engine = engine("overlap_unknown.wal");
    assert!(!engine.has_overlap(Ulid::new(), Span::new(T, T + H), None).await);
    assert!(engine.find_overlap(Ulid::new(), Span::new(T, T + H), None).await.is_none());
}

#[tokio::test]
async fn appointment_on_unknown_telescope_or_user() {
    let (engine, telescope, user) = setup("unknown_refs.wal", AllottedTime::Unlimited).await;
    assert!(matches!(
        engine.create_appointment(new_appt(Ulid::new(), user, T, T + H)).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.create_appointment(new_appt(telescope, Ulid::new(), T, T + H)).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn duplicate_appointment_id_rejected() {
    let (engine, telescope, user) = setup("dup_appt.wal", AllottedTime::Unlimited).await;
    let first = new_appt(telescope, user, T, T + H);
    let mut again = new_appt(telescope, user, T + 2 * H, T + 3 * H);
    again.id = first.id;
    engine.create_appointment(first).await.unwrap();
    assert!(matches!(
        engine.create_appointment(again).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

// ── Reschedule ───────────────────────────────────────────

#[tokio::test]
async fn reschedule_excludes_own_window() {
    let (engine, telescope, user) = setup("reschedule_self.wal", AllottedTime::Unlimited).await;
    let new = new_appt(telescope, user, T, T + 50_000);
    let id = new.id;
    engine.create_appointment(new).await.unwrap();

    engine.reschedule_appointment(id, Span::new(T, T + 55_000)).await.unwrap();
    assert_eq!(
        engine.get_appointment(id).await.unwrap().span,
        Span::new(T, T + 55_000)
    );
}

#[tokio::test]
async fn reschedule_into_neighbour_rejected() {
    let (engine, telescope, user) = setup("reschedule_clash.wal", AllottedTime::Unlimited).await;
    let a = new_appt(telescope, user, T, T + H);
    let b = new_appt(telescope, user, T + 2 * H, T + 3 * H);
    let (a_id, b_id) = (a.id, b.id);
    engine.create_appointment(a).await.unwrap();
    engine.create_appointment(b).await.unwrap();

    assert!(matches!(
        engine.reschedule_appointment(a_id, Span::new(T + 90 * M, T + 150 * M)).await,
        Err(EngineError::Overlap(id)) if id == b_id
    ));
    assert_eq!(engine.get_appointment(a_id).await.unwrap().span, Span::new(T, T + H));
}

#[tokio::test]
async fn reschedule_keeps_start_order() {
    let (engine, telescope, user) = setup("reschedule_order.wal", AllottedTime::Unlimited).await;
    let a = new_appt(telescope, user, T, T + H);
    let a_id = a.id;
    engine.create_appointment(a).await.unwrap();
    engine.create_appointment(new_appt(telescope, user, T + 2 * H, T + 3 * H)).await.unwrap();

    engine.reschedule_appointment(a_id, Span::new(T + 5 * H, T + 6 * H)).await.unwrap();
    let list = engine.appointments_for_telescope(telescope).await;
    assert!(list.windows(2).all(|w| w[0].span.start <= w[1].span.start));
    assert_eq!(list.last().unwrap().id, a_id);
}

#[tokio::test]
async fn reschedule_running_appointment_rejected() {
    let (engine, telescope, user) = setup("reschedule_running.wal", AllottedTime::Unlimited).await;
    let new = new_appt(telescope, user, T, T + H);
    let id = new.id;
    engine.create_appointment(new).await.unwrap();
    engine.start_appointment(id).await.unwrap();
    assert!(matches!(
        engine.reschedule_appointment(id, Span::new(T, T + 2 * H)).await,
        Err(EngineError::InvalidTransition { action: "reschedule", .. })
    ));
}

// ── Allotted time ────────────────────────────────────────

#[tokio::test]
async fn quota_exceeded_rejected() {
    let (engine, telescope, user) = setup("quota.wal", AllottedTime::Limited(5 * H)).await;
    engine
        .create_appointment(new_appt(telescope, user, T, T + 4 * H + 30 * M))
        .await
        .unwrap();

    let over = new_appt(telescope, user, T + 5 * H, T + 6 * H);
    let over_id = over.id;
    let err = engine.create_appointment(over).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::QuotaExceeded { cap_ms, used_ms, requested_ms, .. }
            if cap_ms == 5 * H && used_ms == 4 * H + 30 * M && requested_ms == H
    ));
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    assert!(engine.get_appointment(over_id).await.is_none());
    assert_eq!(engine.used_time(user), 4 * H + 30 * M);
    assert_eq!(engine.remaining_time(user).unwrap(), Some(30 * M));
}

#[tokio::test]
async fn quota_exactly_reached_is_allowed() {
    let (engine, telescope, user) = setup("quota_exact.wal", AllottedTime::Limited(5 * H)).await;
    engine.create_appointment(new_appt(telescope, user, T, T + 4 * H)).await.unwrap();
    engine.create_appointment(new_appt(telescope, user, T + 4 * H, T + 5 * H)).await.unwrap();
    assert_eq!(engine.remaining_time(user).unwrap(), Some(0));
    assert!(engine.would_exceed_cap(user, 1).unwrap());
}

#[tokio::test]
async fn unlimited_cap_never_exceeded() {
    let (engine, telescope, user) = setup("unlimited.wal", AllottedTime::Unlimited).await;
    for day in 0..10 {
        let start = T + day * 24 * H;
        engine
            .create_appointment(new_appt(telescope, user, start, start + 20 * H))
            .await
            .unwrap();
    }
    assert_eq!(engine.remaining_time(user).unwrap(), None);
    assert!(!engine.would_exceed_cap(user, 1_000 * H).unwrap());
}

#[tokio::test]
async fn role_default_applies_without_explicit_cap() {
    let engine = engine("role_default.wal");
    let telescope = Ulid::new();
    engine.create_telescope(telescope, None).await.unwrap();
    let user = Ulid::new();
    engine
        .register_user(user, None, roles(&[Role::Guest, Role::Student]))
        .await
        .unwrap();

    assert_eq!(engine.allotted_cap(user).unwrap(), AllottedTime::Limited(20 * H));
    engine.create_appointment(new_appt(telescope, user, T, T + 20 * H)).await.unwrap();
    assert!(matches!(
        engine.create_appointment(new_appt(telescope, user, T + 21 * H, T + 22 * H)).await,
        Err(EngineError::QuotaExceeded { .. })
    ));
}

#[tokio::test]
async fn explicit_cap_overrides_role_default() {
    let engine = engine("explicit_cap.wal");
    let user = Ulid::new();
    engine.register_user(user, None, roles(&[Role::Member])).await.unwrap();
    engine.set_allotted_time(user, AllottedTime::Limited(H)).await.unwrap();
    assert_eq!(engine.allotted_cap(user).unwrap(), AllottedTime::Limited(H));
}

#[tokio::test]
async fn missing_allotted_time_is_integrity_error() {
    let engine = engine("missing_cap.wal");
    let telescope = Ulid::new();
    engine.create_telescope(telescope, None).await.unwrap();
    let user = Ulid::new();
    engine.register_user(user, None, RoleSet::new()).await.unwrap();

    let err = engine
        .create_appointment(new_appt(telescope, user, T, T + H))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MissingAllottedTime(id) if id == user));
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert!(matches!(
        engine.allotted_cap(Ulid::new()),
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn negative_cap_rejected() {
    let (engine, _, user) = setup("negative_cap.wal", AllottedTime::Unlimited).await;
    assert!(matches!(
        engine.set_allotted_time(user, AllottedTime::Limited(-1)).await,
        Err(EngineError::Invalid(_))
    ));
}

#[tokio::test]
async fn canceled_time_is_returned() {
    let (engine, telescope, user) = setup("quota_cancel.wal", AllottedTime::Limited(2 * H)).await;
    let a = new_appt(telescope, user, T, T + 2 * H);
    let a_id = a.id;
    engine.create_appointment(a).await.unwrap();
    assert_eq!(engine.remaining_time(user).unwrap(), Some(0));

    engine.cancel_appointment(a_id).await.unwrap();
    assert_eq!(engine.used_time(user), 0);
    engine
        .create_appointment(new_appt(telescope, user, T + 3 * H, T + 5 * H))
        .await
        .unwrap();
}

#[tokio::test]
async fn reschedule_counts_only_new_duration() {
    let (engine, telescope, user) = setup("quota_reschedule.wal", AllottedTime::Limited(5 * H)).await;
    let a = new_appt(telescope, user, T, T + 4 * H);
    let a_id = a.id;
    engine.create_appointment(a).await.unwrap();

    // 5h total is fine because the old 4h no longer counts.
    engine.reschedule_appointment(a_id, Span::new(T, T + 5 * H)).await.unwrap();
    assert!(matches!(
        engine.reschedule_appointment(a_id, Span::new(T, T + 5 * H + M)).await,
        Err(EngineError::QuotaExceeded { .. })
    ));
    assert_eq!(engine.used_time(user), 5 * H);
}

#[tokio::test]
async fn requested_time_not_counted_by_default() {
    let (engine, telescope, user) = setup("quota_requested.wal", AllottedTime::Limited(2 * H)).await;
    let pending = new_appt(telescope, user, T, T + 2 * H);
    let pending_id = pending.id;
    engine.request_appointment(pending).await.unwrap();
    assert_eq!(engine.used_time(user), 0);

    // Both fit individually; approving the second pushes over the cap.
    let other = new_appt(telescope, user, T + 3 * H, T + 5 * H);
    let other_id = other.id;
    engine.request_appointment(other).await.unwrap();
    engine.approve_appointment(pending_id).await.unwrap();
    assert!(matches!(
        engine.approve_appointment(other_id).await,
        Err(EngineError::QuotaExceeded { .. })
    ));
    assert_eq!(status_of(&engine, other_id).await, AppointmentStatus::Requested);
}

#[tokio::test]
async fn requested_time_counted_when_configured() {
    let engine = Engine::new(
        test_wal_path("quota_count_requested.wal"),
        Arc::new(NotifyHub::new()),
        QuotaPolicy { count_requested: true },
    )
    .unwrap();
    let telescope = Ulid::new();
    engine.create_telescope(telescope, None).await.unwrap();
    let user = Ulid::new();
    engine.register_user(user, None, roles(&[Role::Guest])).await.unwrap();

    engine.request_appointment(new_appt(telescope, user, T, T + 3 * H)).await.unwrap();
    assert_eq!(engine.used_time(user), 3 * H);
    assert!(matches!(
        engine.request_appointment(new_appt(telescope, user, T + 4 * H, T + 7 * H)).await,
        Err(EngineError::QuotaExceeded { .. })
    ));
}

#[tokio::test]
async fn allotted_time_info_reports_usage() {
    let (engine, telescope, user) = setup("quota_info.wal", AllottedTime::Limited(5 * H)).await;
    engine.create_appointment(new_appt(telescope, user, T, T + 2 * H)).await.unwrap();
    let info = engine.allotted_time_info(user).unwrap();
    assert_eq!(info.cap, AllottedTime::Limited(5 * H));
    assert_eq!(info.used_ms, 2 * H);
    assert_eq!(info.remaining_ms, Some(3 * H));
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn full_lifecycle() {
    let (engine, telescope, user) = setup("lifecycle.wal", AllottedTime::Unlimited).await;
    let new = new_appt(telescope, user, T, T + H);
    let id = new.id;
    engine.request_appointment(new).await.unwrap();
    assert_eq!(status_of(&engine, id).await, AppointmentStatus::Requested);

    engine.approve_appointment(id).await.unwrap();
    assert_eq!(status_of(&engine, id).await, AppointmentStatus::Scheduled);
    engine.start_appointment(id).await.unwrap();
    assert_eq!(status_of(&engine, id).await, AppointmentStatus::InProgress);
    engine.complete_appointment(id).await.unwrap();
    assert_eq!(status_of(&engine, id).await, AppointmentStatus::Completed);

    // Completed time still counts.
    assert_eq!(engine.used_time(user), H);
}

#[tokio::test]
async fn deny_request() {
    let (engine, telescope, user) = setup("deny.wal", AllottedTime::Unlimited).await;
    let new = new_appt(telescope, user, T, T + H);
    let id = new.id;
    engine.request_appointment(new).await.unwrap();
    engine.deny_appointment(id).await.unwrap();
    assert_eq!(status_of(&engine, id).await, AppointmentStatus::Canceled);
}

#[tokio::test]
async fn approve_canceled_is_invalid_transition() {
    let (engine, telescope, user) = setup("approve_canceled.wal", AllottedTime::Unlimited).await;
    let new = new_appt(telescope, user, T, T + H);
    let id = new.id;
    engine.request_appointment(new).await.unwrap();
    engine.cancel_appointment(id).await.unwrap();

    let err = engine.approve_appointment(id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition { from: AppointmentStatus::Canceled, action: "approve", .. }
    ));
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    assert_eq!(status_of(&engine, id).await, AppointmentStatus::Canceled);
}

#[tokio::test]
async fn cancel_twice_rejected() {
    let (engine, telescope, user) = setup("cancel_twice.wal", AllottedTime::Unlimited).await;
    let new = new_appt(telescope, user, T, T + H);
    let id = new.id;
    engine.create_appointment(new).await.unwrap();
    engine.cancel_appointment(id).await.unwrap();
    assert!(matches!(
        engine.cancel_appointment(id).await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn transition_on_unknown_appointment() {
    let engine = engine("transition_unknown.wal");
    assert!(matches!(
        engine.start_appointment(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn start_blocked_while_telescope_busy() {
    let (engine, telescope, user) = setup("start_busy.wal", AllottedTime::Unlimited).await;
    let first = new_appt(telescope, user, T, T + H);
    let second = new_appt(telescope, user, T + H, T + 2 * H);
    let (first_id, second_id) = (first.id, second.id);
    engine.create_appointment(first).await.unwrap();
    engine.create_appointment(second).await.unwrap();

    engine.start_appointment(first_id).await.unwrap();
    assert!(matches!(
        engine.start_appointment(second_id).await,
        Err(EngineError::TelescopeBusy(id)) if id == first_id
    ));

    engine.complete_appointment(first_id).await.unwrap();
    engine.start_appointment(second_id).await.unwrap();
}

#[tokio::test]
async fn transitions_notify_subscribers() {
    let (engine, telescope, user) = setup("notify.wal", AllottedTime::Unlimited).await;
    let mut rx = engine.notify.subscribe(telescope);
    let new = new_appt(telescope, user, T, T + H);
    let id = new.id;
    engine.create_appointment(new).await.unwrap();
    engine.start_appointment(id).await.unwrap();

    assert!(matches!(rx.recv().await.unwrap(), Event::AppointmentCreated { .. }));
    assert_eq!(rx.recv().await.unwrap(), Event::AppointmentStatusChanged {
        id,
        telescope_id: telescope,
        status: AppointmentStatus::InProgress,
    });
}

// ── Free control, calibration, purge ─────────────────────

#[tokio::test]
async fn free_control_coordinates_and_calibration() {
    let (engine, telescope, user) = setup("free_control.wal", AllottedTime::Unlimited).await;
    let mut new = new_appt(telescope, user, T, T + H);
    new.kind = AppointmentType::FreeControl;
    let id = new.id;
    engine.create_appointment(new).await.unwrap();

    let coordinate = Coordinate { hours: 5, minutes: 35, seconds: 17, declination: -5.39 };
    // Not running yet.
    assert!(matches!(
        engine.add_coordinate(id, coordinate).await,
        Err(EngineError::InvalidTransition { .. })
    ));

    engine.start_appointment(id).await.unwrap();
    engine.add_coordinate(id, coordinate).await.unwrap();
    let before = now_ms();
    engine.calibrate(id).await.unwrap();

    let appointment = engine.get_appointment(id).await.unwrap();
    assert_eq!(appointment.coordinates, vec![coordinate]);
    assert!(appointment.calibrated_at.unwrap() >= before);
}

#[tokio::test]
async fn coordinates_need_free_control() {
    let (engine, telescope, user) = setup("not_free_control.wal", AllottedTime::Unlimited).await;
    let new = new_appt(telescope, user, T, T + H);
    let id = new.id;
    engine.create_appointment(new).await.unwrap();
    engine.start_appointment(id).await.unwrap();

    let coordinate = Coordinate { hours: 1, minutes: 2, seconds: 3, declination: 4.0 };
    assert!(matches!(
        engine.add_coordinate(id, coordinate).await,
        Err(EngineError::Invalid(_))
    ));
    assert!(matches!(engine.calibrate(id).await, Err(EngineError::Invalid(_))));
    let bad = Coordinate { hours: 24, ..coordinate };
    assert!(matches!(engine.add_coordinate(id, bad).await, Err(EngineError::Invalid(_))));
}

#[tokio::test]
async fn purge_only_canceled() {
    let (engine, telescope, user) = setup("purge.wal", AllottedTime::Unlimited).await;
    let new = new_appt(telescope, user, T, T + H);
    let id = new.id;
    engine.create_appointment(new).await.unwrap();

    assert!(matches!(
        engine.purge_appointment(id).await,
        Err(EngineError::InvalidTransition { action: "purge", .. })
    ));
    engine.cancel_appointment(id).await.unwrap();
    assert_eq!(engine.collect_purgeable(T + H), vec![id]);
    assert!(engine.collect_purgeable(T + H - 1).is_empty());

    engine.purge_appointment(id).await.unwrap();
    assert!(engine.get_appointment(id).await.is_none());
    assert!(matches!(
        engine.purge_appointment(id).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn appointments_for_user_across_telescopes() {
    let (engine, telescope, user) = setup("by_user.wal", AllottedTime::Unlimited).await;
    let other_telescope = Ulid::new();
    engine.create_telescope(other_telescope, None).await.unwrap();
    let other_user = Ulid::new();
    engine.register_user(other_user, None, roles(&[Role::Admin])).await.unwrap();

    engine.create_appointment(new_appt(other_telescope, user, T + H, T + 2 * H)).await.unwrap();
    engine.create_appointment(new_appt(telescope, user, T, T + H)).await.unwrap();
    engine.create_appointment(new_appt(telescope, other_user, T + H, T + 2 * H)).await.unwrap();

    let mine = engine.appointments_for_user(user).await;
    assert_eq!(mine.len(), 2);
    assert_eq!(mine[0].span.start, T);
    assert_eq!(engine.all_appointments().await.len(), 3);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let telescope = Ulid::new();
    let user = Ulid::new();
    let (scheduled, canceled, running) = (Ulid::new(), Ulid::new(), Ulid::new());
    {
        let engine =
            Engine::new(path.clone(), Arc::new(NotifyHub::new()), QuotaPolicy::default()).unwrap();
        engine.create_telescope(telescope, Some("Dish".into())).await.unwrap();
        engine.register_user(user, Some("ada".into()), roles(&[Role::Student])).await.unwrap();
        engine.set_allotted_time(user, AllottedTime::Limited(10 * H)).await.unwrap();

        let mut a = new_appt(telescope, user, T, T + H);
        a.id = scheduled;
        engine.create_appointment(a).await.unwrap();
        engine.reschedule_appointment(scheduled, Span::new(T, T + 2 * H)).await.unwrap();

        let mut b = new_appt(telescope, user, T + 3 * H, T + 4 * H);
        b.id = canceled;
        engine.request_appointment(b).await.unwrap();
        engine.deny_appointment(canceled).await.unwrap();

        let mut c = new_appt(telescope, user, T + 5 * H, T + 6 * H);
        c.id = running;
        c.kind = AppointmentType::FreeControl;
        engine.create_appointment(c).await.unwrap();
        engine.start_appointment(running).await.unwrap();
        engine
            .add_coordinate(running, Coordinate { hours: 1, minutes: 0, seconds: 0, declination: 0.0 })
            .await
            .unwrap();
    }

    let engine = Engine::new(path, Arc::new(NotifyHub::new()), QuotaPolicy::default()).unwrap();
    assert_eq!(engine.list_telescopes().await[0].name.as_deref(), Some("Dish"));
    assert_eq!(engine.get_user(&user).unwrap().roles, roles(&[Role::Student]));
    assert_eq!(engine.allotted_cap(user).unwrap(), AllottedTime::Limited(10 * H));
    assert_eq!(
        engine.get_appointment(scheduled).await.unwrap().span,
        Span::new(T, T + 2 * H)
    );
    assert_eq!(status_of(&engine, canceled).await, AppointmentStatus::Canceled);
    assert_eq!(engine.get_appointment(running).await.unwrap().coordinates.len(), 1);
    assert_eq!(engine.used_time(user), 3 * H);

    // Replayed state still enforces overlap.
    assert!(matches!(
        engine.create_appointment(new_appt(telescope, user, T + H, T + 90 * M)).await,
        Err(EngineError::Overlap(id)) if id == scheduled
    ));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let telescope = Ulid::new();
    let user = Ulid::new();
    let mut kept = Vec::new();
    {
        let engine =
            Engine::new(path.clone(), Arc::new(NotifyHub::new()), QuotaPolicy::default()).unwrap();
        engine.create_telescope(telescope, None).await.unwrap();
        engine.register_user(user, None, roles(&[Role::Admin])).await.unwrap();
        for i in 0..20 {
            let new = new_appt(telescope, user, T + i * H, T + i * H + 30 * M);
            let id = new.id;
            engine.create_appointment(new).await.unwrap();
            if i % 2 == 0 {
                engine.cancel_appointment(id).await.unwrap();
                engine.purge_appointment(id).await.unwrap();
            } else {
                kept.push(id);
            }
        }
        let before = std::fs::metadata(&path).unwrap().len();
        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(std::fs::metadata(&path).unwrap().len() < before);

        // Writes after compaction land in the new file.
        engine.complete_appointment(kept[0]).await.unwrap_err();
        engine.start_appointment(kept[0]).await.unwrap();
    }

    let engine = Engine::new(path, Arc::new(NotifyHub::new()), QuotaPolicy::default()).unwrap();
    let list = engine.appointments_for_telescope(telescope).await;
    assert_eq!(list.len(), kept.len());
    assert_eq!(status_of(&engine, kept[0]).await, AppointmentStatus::InProgress);
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_creates_one_wins() {
    let (engine, telescope, user) = setup("concurrent_overlap.wal", AllottedTime::Unlimited).await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let start = T + i * M;
            engine
                .create_appointment(new_appt(telescope, user, start, start + H))
                .await
        }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(()) => ok += 1,
            Err(e) => assert!(matches!(e, EngineError::Overlap(_))),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.appointments_for_telescope(telescope).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_respect_quota_across_telescopes() {
    let engine = Arc::new(engine("concurrent_quota.wal"));
    let user = Ulid::new();
    engine.register_user(user, None, roles(&[Role::Guest])).await.unwrap();
    engine.set_allotted_time(user, AllottedTime::Limited(3 * H)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let telescope = Ulid::new();
        engine.create_telescope(telescope, None).await.unwrap();
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.create_appointment(new_appt(telescope, user, T, T + H)).await
        }));
    }

    let mut ok = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            ok += 1;
        }
    }
    assert_eq!(ok, 3);
    assert_eq!(engine.used_time(user), 3 * H);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_telescope_creates_one_wins() {
    let engine = Arc::new(engine("concurrent_telescope_create.wal"));
    let telescope = Ulid::new();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.create_telescope(telescope, None).await
        }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(()) => ok += 1,
            Err(e) => assert!(matches!(e, EngineError::AlreadyExists(id) if id == telescope)),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.list_telescopes().await.len(), 1);
}

#[tokio::test]
async fn duplicate_create_keeps_existing_bookings() {
    let (engine, telescope, user) = setup("duplicate_create_keeps.wal", AllottedTime::Unlimited).await;
    let appt = new_appt(telescope, user, T, T + H);
    let id = appt.id;
    engine.create_appointment(appt).await.unwrap();

    assert!(matches!(
        engine.create_telescope(telescope, None).await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert_eq!(engine.appointments_for_telescope(telescope).await.len(), 1);
    assert!(engine.get_appointment(id).await.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn booking_queued_behind_delete_is_rejected() {
    let (engine, telescope, user) = setup("delete_then_book.wal", AllottedTime::Limited(5 * H)).await;
    let engine = Arc::new(engine);

    // Hold the telescope so both writers queue up: delete first, then the booking.
    let ts = engine.get_telescope(&telescope).unwrap();
    let held = ts.write().await;

    let deleter = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.delete_telescope(telescope).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let appt = new_appt(telescope, user, T, T + 4 * H);
    let appt_id = appt.id;
    let booker = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.create_appointment(appt).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    drop(held);

    deleter.await.unwrap().unwrap();
    assert!(matches!(
        booker.await.unwrap(),
        Err(EngineError::NotFound(id)) if id == telescope
    ));

    assert!(engine.get_telescope(&telescope).is_none());
    assert!(engine.locate_appointment(&appt_id).is_none());
    assert_eq!(engine.used_time(user), 0);
    assert_eq!(engine.remaining_time(user).unwrap(), Some(5 * H));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transition_queued_behind_delete_is_rejected() {
    let (engine, telescope, user) = setup("delete_then_transition.wal", AllottedTime::Unlimited).await;
    let appt = new_appt(telescope, user, T, T + H);
    let id = appt.id;
    engine.create_appointment(appt).await.unwrap();
    engine.cancel_appointment(id).await.unwrap();
    let engine = Arc::new(engine);

    let ts = engine.get_telescope(&telescope).unwrap();
    let held = ts.write().await;

    let deleter = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.delete_telescope(telescope).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let purger = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.purge_appointment(id).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    drop(held);

    deleter.await.unwrap().unwrap();
    assert!(matches!(purger.await.unwrap(), Err(EngineError::NotFound(_))));
    assert!(engine.locate_appointment(&id).is_none());
}
