use std::fmt;

/// Event type of chat messages; classified further by `chatMessage.type`
pub const CHAT_MESSAGE: i64 = 1000;
pub const NOTIFICATION: i64 = 10;
pub const ACTION_START: i64 = 304;
pub const ACTION_END: i64 = 306;

/// Closed set of realtime event topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    /// Plain text message, and any chat message sub-type not listed below
    Message,
    Sticker,
    MessageDeleted,
    MemberJoined,
    MemberLeft,
    ChatInvite,
    BackgroundChanged,
    TitleChanged,
    IconChanged,
    VoiceChatStarted,
    VideoChatStarted,
    AvatarChatStarted,
    VoiceChatEnded,
    VideoChatEnded,
    AvatarChatEnded,
    ContentChanged,
    ScreeningRoomStarted,
    ScreeningRoomEnded,
    HostTransferred,
    Notification,
    ActionStarted,
    ActionEnded,
    /// Any event type without a known topic
    Unrecognized,
}

impl EventTopic {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Sticker => "sticker",
            Self::MessageDeleted => "message_deleted",
            Self::MemberJoined => "member_joined",
            Self::MemberLeft => "member_left",
            Self::ChatInvite => "chat_invite",
            Self::BackgroundChanged => "background_changed",
            Self::TitleChanged => "title_changed",
            Self::IconChanged => "icon_changed",
            Self::VoiceChatStarted => "voice_chat_started",
            Self::VideoChatStarted => "video_chat_started",
            Self::AvatarChatStarted => "avatar_chat_started",
            Self::VoiceChatEnded => "voice_chat_ended",
            Self::VideoChatEnded => "video_chat_ended",
            Self::AvatarChatEnded => "avatar_chat_ended",
            Self::ContentChanged => "content_changed",
            Self::ScreeningRoomStarted => "screening_room_started",
            Self::ScreeningRoomEnded => "screening_room_ended",
            Self::HostTransferred => "host_transferred",
            Self::Notification => "notification",
            Self::ActionStarted => "action_started",
            Self::ActionEnded => "action_ended",
            Self::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topic of an event from its type and, for chat messages, its sub-type
pub const fn classify(event_type: i64, subtype: Option<i64>) -> EventTopic {
    match event_type {
        CHAT_MESSAGE => classify_message(subtype),
        NOTIFICATION => EventTopic::Notification,
        ACTION_START => EventTopic::ActionStarted,
        ACTION_END => EventTopic::ActionEnded,
        _ => EventTopic::Unrecognized,
    }
}

const fn classify_message(subtype: Option<i64>) -> EventTopic {
    let Some(subtype) = subtype else {
        return EventTopic::Message;
    };

    match subtype {
        3 => EventTopic::Sticker,
        100 => EventTopic::MessageDeleted,
        101 => EventTopic::MemberJoined,
        102 => EventTopic::MemberLeft,
        103 => EventTopic::ChatInvite,
        104 => EventTopic::BackgroundChanged,
        105 => EventTopic::TitleChanged,
        106 => EventTopic::IconChanged,
        107 => EventTopic::VoiceChatStarted,
        108 => EventTopic::VideoChatStarted,
        109 => EventTopic::AvatarChatStarted,
        110 => EventTopic::VoiceChatEnded,
        111 => EventTopic::VideoChatEnded,
        112 => EventTopic::AvatarChatEnded,
        113 => EventTopic::ContentChanged,
        114 => EventTopic::ScreeningRoomStarted,
        115 => EventTopic::ScreeningRoomEnded,
        116 => EventTopic::HostTransferred,
        _ => EventTopic::Message,
    }
}
