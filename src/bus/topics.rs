use crate::model::ChannelName;

/// Unroutable and undeliverable messages end up here.
pub const DEAD_LETTER_TOPIC: &str = "chansync.dead-letter";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Calendar,
    Reservation,
    Message,
    Listing,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Calendar,
        Category::Reservation,
        Category::Message,
        Category::Listing,
    ];

    /// Static prefix table: `calendar.*`, `reservation.*`, `message.*`, `listing.*`.
    pub fn from_event_type(event_type: &str) -> Option<Category> {
        let (prefix, rest) = event_type.split_once('.')?;
        if rest.is_empty() {
            return None;
        }
        match prefix {
            "calendar" => Some(Category::Calendar),
            "reservation" => Some(Category::Reservation),
            "message" => Some(Category::Message),
            "listing" => Some(Category::Listing),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Calendar => "calendar",
            Category::Reservation => "reservation",
            Category::Message => "message",
            Category::Listing => "listing",
        }
    }

    pub fn topic(&self, channel: ChannelName) -> String {
        let suffix = match self {
            Category::Calendar => "calendar.sync",
            Category::Reservation => "reservations",
            Category::Message => "messages",
            Category::Listing => "listings",
        };
        format!("{}.{suffix}", channel.slug())
    }

    /// One consumer group per category per channel.
    pub fn group(&self, channel: ChannelName) -> String {
        format!("{}.{}", channel.slug(), self.as_str())
    }
}

/// Topic for an inbound event; unmapped prefixes go to the dead-letter topic.
pub fn topic_for(channel: ChannelName, event_type: &str) -> String {
    match Category::from_event_type(event_type) {
        Some(category) => category.topic(channel),
        None => DEAD_LETTER_TOPIC.to_string(),
    }
}
