use kube::runtime::events::{Event, EventType, Recorder};

use super::build_obj_ref;

pub const REASON_FORMED: &str = "Formed";
pub const REASON_EXPIRED: &str = "Expired";
pub const REASON_SHORTAGE: &str = "Shortage";
pub const REASON_COLLISION: &str = "Collision";
pub const REASON_INELIGIBLE: &str = "Ineligible";
pub const REASON_EVICTED: &str = "Evicted";

pub async fn emit_event(
    recorder: &Recorder,
    ns: &str,
    name: &str,
    uid: Option<&str>,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    let _ = recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: reason.into(),
                note,
                action: action.into(),
                secondary: None,
            },
            &build_obj_ref(ns, name, uid),
        )
        .await;
}

pub async fn emit_warning(
    recorder: &Recorder,
    ns: &str,
    name: &str,
    uid: Option<&str>,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    let _ = recorder
        .publish(
            &Event {
                type_: EventType::Warning,
                reason: reason.into(),
                note,
                action: action.into(),
                secondary: None,
            },
            &build_obj_ref(ns, name, uid),
        )
        .await;
}
