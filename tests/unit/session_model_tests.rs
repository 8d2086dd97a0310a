use chrono::{TimeZone, Utc};

use story_dispatch::models::session::{derive_session_id, excerpt, Session, SessionStatus};
use story_dispatch::AppError;

#[test]
fn new_session_is_starting() {
    let session = Session::new("dispatch", "1.2", "abcdef0123456789");
    assert_eq!(session.status, SessionStatus::Starting);
    assert!(session.is_active());
    assert!(session.session_id.starts_with("dispatch-1-2-abcdef01-"));
    assert_eq!(session.external_ref, None);
}

#[test]
fn session_id_layout() {
    let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single().expect("time");
    let id = derive_session_id("p", "3.1.4", "deadbeefcafe", at);
    assert_eq!(id, format!("p-3-1-4-deadbeef-{}", at.timestamp_millis()));
}

#[test]
fn terminal_statuses() {
    let terminal: Vec<SessionStatus> = SessionStatus::ALL
        .into_iter()
        .filter(|s| s.is_terminal())
        .collect();
    assert_eq!(
        terminal,
        vec![
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Error,
            SessionStatus::Exception,
        ]
    );
}

#[test]
fn status_strings_parse_back() {
    for status in SessionStatus::ALL {
        assert_eq!(status.as_str().parse::<SessionStatus>().expect("parse"), status);
    }
}

#[test]
fn unknown_status_is_corrupt() {
    let err = "paused".parse::<SessionStatus>().expect_err("unknown");
    assert!(matches!(err, AppError::CorruptRecord(_)), "got {err}");
}

#[test]
fn lifecycle_transitions() {
    let mut session = Session::new("p", "a", "fp");
    assert!(session.can_transition_to(SessionStatus::Running));
    assert!(session.can_transition_to(SessionStatus::Error));
    assert!(!session.can_transition_to(SessionStatus::Starting));

    session.status = SessionStatus::Running;
    assert!(session.can_transition_to(SessionStatus::Completed));
    assert!(!session.can_transition_to(SessionStatus::Running));
    assert!(!session.can_transition_to(SessionStatus::Starting));

    session.status = SessionStatus::Completed;
    for next in SessionStatus::ALL {
        assert!(!session.can_transition_to(next), "terminal must not move to {next}");
    }
}

#[test]
fn excerpt_counts_characters() {
    assert_eq!(excerpt("héllo wörld", 7), "héllo w");
    assert_eq!(excerpt("short", 100), "short");
}

#[test]
fn session_serializes_with_stable_field_names() {
    let session = Session::new("p", "a", "fp");
    let value = serde_json::to_value(&session).expect("serialize");
    for field in [
        "session_id",
        "task_id",
        "content_fingerprint",
        "status",
        "started_at",
        "external_ref",
        "output_excerpt",
    ] {
        assert!(value.get(field).is_some(), "missing {field}");
    }
    assert_eq!(value["status"], "starting");
}
