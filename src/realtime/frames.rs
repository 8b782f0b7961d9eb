//! Builders for outbound realtime frames
//!
//! `id` is the elapsed-realtime clock value at the time of sending.

use crate::realtime::codec::Frame;
use serde_json::json;

pub const JOIN_THREAD: i64 = 112;
pub const THREAD_CHANNEL: i64 = 108;
pub const ACTION_START: i64 = 304;
pub const ACTION_END: i64 = 306;
pub const COMMUNITY_EVENT: i64 = 20;

const ROLE_MEMBER: u8 = 1;
const ROLE_VIEWER: u8 = 2;
const CHANNEL_VOICE: u8 = 1;
const CHANNEL_VIDEO: u8 = 5;

pub fn thread_target(ndc_id: i64, thread_id: &str) -> String {
    format!("ndc://x{}/chat-thread/{}", ndc_id, thread_id)
}

pub fn join_voice_thread(ndc_id: i64, thread_id: &str, id: u64) -> Frame {
    join(ndc_id, thread_id, ROLE_MEMBER, id)
}

pub fn join_video_thread(ndc_id: i64, thread_id: &str, id: u64) -> Frame {
    Frame {
        t: THREAD_CHANNEL,
        o: json!({
            "ndcId": ndc_id,
            "threadId": thread_id,
            "joinRole": ROLE_MEMBER,
            "channelType": CHANNEL_VIDEO,
            "id": id.to_string(),
        }),
    }
}

pub fn join_video_thread_as_viewer(ndc_id: i64, thread_id: &str, id: u64) -> Frame {
    join(ndc_id, thread_id, ROLE_VIEWER, id)
}

/// Opens the voice channel; sent right after `join_voice_thread`
pub fn start_voice_channel(ndc_id: i64, thread_id: &str, id: u64) -> Frame {
    Frame {
        t: THREAD_CHANNEL,
        o: json!({
            "ndcId": ndc_id,
            "threadId": thread_id,
            "channelType": CHANNEL_VOICE,
            "id": id.to_string(),
        }),
    }
}

pub fn leave_voice_thread(ndc_id: i64, thread_id: &str, id: u64) -> Frame {
    join(ndc_id, thread_id, ROLE_VIEWER, id)
}

pub fn typing(ndc_id: i64, thread_id: &str, id: u64) -> Frame {
    action(
        ACTION_START,
        "Typing",
        thread_target(ndc_id, thread_id),
        ndc_id,
        json!({ "threadType": 2 }),
        id,
    )
}

pub fn recording(ndc_id: i64, thread_id: &str, id: u64) -> Frame {
    action(
        ACTION_START,
        "Recording",
        thread_target(ndc_id, thread_id),
        ndc_id,
        json!({ "threadType": 0 }),
        id,
    )
}

pub fn end_recording(ndc_id: i64, thread_id: &str, duration: u64, id: u64) -> Frame {
    action(
        ACTION_END,
        "Recording",
        thread_target(ndc_id, thread_id),
        ndc_id,
        json!({ "threadType": 0, "duration": duration }),
        id,
    )
}

pub fn community_browsing(ndc_id: i64, topic_ids: &[i64], id: u64) -> Frame {
    action(
        ACTION_START,
        "Browsing",
        format!("ndc://x{}", ndc_id),
        ndc_id,
        json!({ "topicIds": topic_ids }),
        id,
    )
}

pub fn community_enter(ndc_id: i64, time_millis: i64) -> Frame {
    Frame {
        t: COMMUNITY_EVENT,
        o: json!({
            "eventName": "AminoEntered",
            "ndcId": ndc_id,
            "time": time_millis,
        }),
    }
}

pub fn chatting(ndc_id: i64, thread_id: &str, topic_ids: &[i64], id: u64) -> Frame {
    action(
        ACTION_START,
        "Chatting",
        thread_target(ndc_id, thread_id),
        ndc_id,
        json!({ "topicIds": topic_ids, "threadType": 0, "membershipStatus": 0 }),
        id,
    )
}

fn join(ndc_id: i64, thread_id: &str, role: u8, id: u64) -> Frame {
    Frame {
        t: JOIN_THREAD,
        o: json!({
            "ndcId": ndc_id,
            "threadId": thread_id,
            "joinRole": role,
            "id": id.to_string(),
        }),
    }
}

fn action(
    t: i64,
    name: &str,
    target: String,
    ndc_id: i64,
    params: serde_json::Value,
    id: u64,
) -> Frame {
    Frame {
        t,
        o: json!({
            "actions": [name],
            "target": target,
            "ndcId": ndc_id,
            "params": params,
            "id": id.to_string(),
        }),
    }
}
