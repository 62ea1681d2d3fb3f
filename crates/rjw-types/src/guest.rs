use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::GuestId;

/// A guest group as held by the guest directory.
///
/// The document core treats this as read-only input. Only `last_modified`
/// matters to it beyond rendering: a committed document is reused as long as
/// the guest's `last_modified` is unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestData {
    /// Access code of the group.
    pub id: GuestId,
    pub display_name: String,
    /// Number of people in the group.
    pub count: u32,
    /// How many of them are in the wedding party.
    #[serde(default)]
    pub wedding_party_count: u32,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub dietary_requirements: Option<String>,
    #[serde(default)]
    pub song_choice: Option<String>,
    /// RSVP code: -1 no answer yet, 0 declined, 1 attending.
    #[serde(default = "default_attendance")]
    pub attendance: i32,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub parking_required: bool,
    pub last_modified: DateTime<Utc>,
}

fn default_attendance() -> i32 {
    -1
}

/// Decoded RSVP state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attendance {
    NoResponse,
    Declined,
    Attending,
}

impl GuestData {
    /// A group with only the required fields set.
    pub fn new(id: GuestId, display_name: impl Into<String>, count: u32) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            count,
            wedding_party_count: 0,
            address: None,
            postcode: None,
            email: None,
            phone: None,
            dietary_requirements: None,
            song_choice: None,
            attendance: default_attendance(),
            admin: false,
            parking_required: false,
            last_modified: Utc::now(),
        }
    }

    /// The RSVP state. Codes other than 0 and 1 read as no response.
    pub fn attendance_status(&self) -> Attendance {
        match self.attendance {
            0 => Attendance::Declined,
            1 => Attendance::Attending,
            _ => Attendance::NoResponse,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_guest_has_no_rsvp() {
        let guest = GuestData::new(GuestId::new("test1").unwrap(), "Test Group 1", 1);
        assert_eq!(guest.attendance, -1);
        assert_eq!(guest.attendance_status(), Attendance::NoResponse);
        assert!(!guest.admin);
    }

    #[test]
    fn attendance_codes() {
        let mut guest = GuestData::new(GuestId::new("test1").unwrap(), "Test Group 1", 2);
        guest.attendance = 1;
        assert_eq!(guest.attendance_status(), Attendance::Attending);
        guest.attendance = 0;
        assert_eq!(guest.attendance_status(), Attendance::Declined);
        guest.attendance = 7;
        assert_eq!(guest.attendance_status(), Attendance::NoResponse);
    }

    #[test]
    fn deserialize_fills_defaults() {
        let json = r#"{
            "id": "test 2",
            "display_name": "Test Group 2",
            "count": 3,
            "last_modified": "2026-06-01T12:00:00Z"
        }"#;
        let guest: GuestData = serde_json::from_str(json).unwrap();
        assert_eq!(guest.id.as_str(), "test2");
        assert_eq!(guest.attendance, -1);
        assert_eq!(guest.wedding_party_count, 0);
        assert!(guest.song_choice.is_none());
    }
}
