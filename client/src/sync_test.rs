use super::*;
use frames::{DrawKind, Point};

fn pencil() -> DrawEvent {
    DrawEvent {
        kind: DrawKind::Pencil,
        points: vec![Point { x: 0.0, y: 0.0 }, Point { x: 1.0, y: 1.0 }],
        ..DrawEvent::clear()
    }
}

fn rectangle() -> DrawEvent {
    DrawEvent {
        kind: DrawKind::Rectangle,
        x0: Some(0.0),
        y0: Some(0.0),
        x1: Some(10.0),
        y1: Some(10.0),
        ..DrawEvent::clear()
    }
}

#[test]
fn gate_accepts_only_the_first_sync_after_arming() {
    let mut gate = SyncGate::default();
    let room = RoomId::canvas("1");

    assert!(!gate.accept(&room));
    gate.arm(room.clone());
    assert!(gate.is_armed(&room));
    assert!(gate.accept(&room));
    assert!(!gate.accept(&room));

    gate.arm(room.clone());
    assert!(gate.accept(&room));
}

#[test]
fn gate_is_per_room() {
    let mut gate = SyncGate::default();
    gate.arm(RoomId::canvas("1"));
    assert!(!gate.accept(&RoomId::canvas("2")));
    assert!(gate.accept(&RoomId::canvas("1")));
}

#[test]
fn forgotten_and_cleared_rooms_reject() {
    let mut gate = SyncGate::default();
    gate.arm(RoomId::canvas("1"));
    gate.arm(RoomId::canvas("2"));
    gate.forget(&RoomId::canvas("1"));
    assert!(!gate.accept(&RoomId::canvas("1")));
    gate.clear();
    assert!(!gate.accept(&RoomId::canvas("2")));
}

#[test]
fn completed_shapes_and_clears_are_due_immediately() {
    let start = Instant::now();
    let mut schedule = SnapshotSchedule::new(SNAPSHOT_INTERVAL, start);
    assert!(schedule.record(&rectangle(), start));
    assert!(schedule.record(&DrawEvent::clear(), start));
}

#[test]
fn pencil_strokes_wait_for_the_interval() {
    let start = Instant::now();
    let mut schedule = SnapshotSchedule::new(SNAPSHOT_INTERVAL, start);

    assert!(!schedule.record(&pencil(), start + Duration::from_secs(5)));
    assert!(schedule.has_pending());
    assert!(!schedule.due(start + Duration::from_secs(29)));
    assert!(schedule.due(start + Duration::from_secs(30)));
    assert!(schedule.record(&pencil(), start + Duration::from_secs(31)));
}

#[test]
fn nothing_is_due_without_pending_changes() {
    let start = Instant::now();
    let schedule = SnapshotSchedule::new(SNAPSHOT_INTERVAL, start);
    assert!(!schedule.due(start + Duration::from_secs(300)));
}

#[test]
fn saving_resets_the_clock() {
    let start = Instant::now();
    let mut schedule = SnapshotSchedule::new(SNAPSHOT_INTERVAL, start);
    schedule.record(&pencil(), start);

    let saved_at = start + Duration::from_secs(30);
    schedule.mark_saved(saved_at);
    assert!(!schedule.has_pending());

    schedule.record(&pencil(), saved_at + Duration::from_secs(1));
    assert!(!schedule.due(saved_at + Duration::from_secs(29)));
    assert!(schedule.due(saved_at + Duration::from_secs(30)));
}
