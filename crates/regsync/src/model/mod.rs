use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use uuid::Uuid;

/// The six remote tables mirrored by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Students,
    Guests,
    Groups,
    Singles,
    QrCodes,
    AttendanceLogs,
}

impl Table {
    /// All mirrored tables, in mount order.
    pub const ALL: [Table; 6] = [
        Table::Students,
        Table::Guests,
        Table::Groups,
        Table::Singles,
        Table::QrCodes,
        Table::AttendanceLogs,
    ];

    /// The remote table name.
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Students => "students",
            Table::Guests => "guests",
            Table::Groups => "groups",
            Table::Singles => "singles",
            Table::QrCodes => "qr_codes",
            Table::AttendanceLogs => "attendance_logs",
        }
    }

    /// The primary-key column rows of this table are keyed by.
    pub fn primary_key(self) -> &'static str {
        match self {
            Table::Students => "student_id",
            Table::Guests => "guest_id",
            Table::Groups => "group_id",
            Table::Singles => "single_id",
            Table::QrCodes => "qr_id",
            Table::AttendanceLogs => "log_id",
        }
    }

    /// Human-readable singular form, used in notification copy.
    pub fn singular(self) -> &'static str {
        match self {
            Table::Students => "student",
            Table::Guests => "guest",
            Table::Groups => "group",
            Table::Singles => "single entry",
            Table::QrCodes => "QR code",
            Table::AttendanceLogs => "attendance log",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed record belonging to one of the mirrored tables.
///
/// The identifier is assigned by the remote store and never reassigned by
/// this layer.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const TABLE: Table;
    type Id: Copy + PartialEq + Into<RecordKey> + fmt::Display + Send + Sync;

    fn id(&self) -> Self::Id;

    /// Primary-key value in its untyped form.
    fn key(&self) -> RecordKey {
        self.id().into()
    }
}

/// Primary-key value of an untyped row: remote stores assign either numeric
/// or UUID identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    Int(i64),
    Uuid(Uuid),
}

impl From<i64> for RecordKey {
    fn from(n: i64) -> Self {
        RecordKey::Int(n)
    }
}

impl From<Uuid> for RecordKey {
    fn from(u: Uuid) -> Self {
        RecordKey::Uuid(u)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Int(n) => write!(f, "{}", n),
            RecordKey::Uuid(u) => write!(f, "{}", u),
        }
    }
}

/// Extract the primary-key value from a raw row of `table`.
///
/// Returns `None` when the key column is missing or has an unexpected shape.
pub fn record_key(table: Table, row: &JsonValue) -> Option<RecordKey> {
    let id = row.get(table.primary_key())?;
    if let Some(n) = id.as_i64() {
        return Some(RecordKey::Int(n));
    }
    id.as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .map(RecordKey::Uuid)
}

/// Performance category of a contestant entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceType {
    Vocal,
    Dance,
    Instrumental,
    Drama,
    Other,
}

/// A registered student contestant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub student_id: i64,
    pub full_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub institution: Option<String>,
    /// Set when the student performs as part of a group.
    #[serde(default)]
    pub group_id: Option<i64>,
    /// Set when the student has a single-contestant entry.
    #[serde(default)]
    pub single_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Entity for Student {
    const TABLE: Table = Table::Students;
    type Id = i64;

    fn id(&self) -> i64 {
        self.student_id
    }
}

/// A non-performing attendee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guest {
    pub guest_id: i64,
    pub full_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub affiliation: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Entity for Guest {
    const TABLE: Table = Table::Guests;
    type Id = i64;

    fn id(&self) -> i64 {
        self.guest_id
    }
}

/// A named group performance unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub group_id: i64,
    pub group_name: String,
    pub performance_type: PerformanceType,
    /// Student ids of the members; may be empty while registration is open.
    #[serde(default)]
    pub member_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

impl Entity for Group {
    const TABLE: Table = Table::Groups;
    type Id = i64;

    fn id(&self) -> i64 {
        self.group_id
    }
}

/// A single-contestant performance entry, linked to exactly one student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Single {
    pub single_id: i64,
    pub student_id: i64,
    pub performance_type: PerformanceType,
    #[serde(default)]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Entity for Single {
    const TABLE: Table = Table::Singles;
    type Id = i64;

    fn id(&self) -> i64 {
        self.single_id
    }
}

/// The identity a QR code was issued to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "owner_type", rename_all = "snake_case")]
pub enum QrOwner {
    Guest { guest_id: i64 },
    Single { single_id: i64 },
    GroupMember { group_id: i64, student_id: i64 },
}

/// An issued QR code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrCode {
    pub qr_id: Uuid,
    #[serde(flatten)]
    pub owner: QrOwner,
    pub issued_at: DateTime<Utc>,
}

impl Entity for QrCode {
    const TABLE: Table = Table::QrCodes;
    type Id = Uuid;

    fn id(&self) -> Uuid {
        self.qr_id
    }
}

/// One scan of a QR code at a check-in station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceLog {
    pub log_id: i64,
    pub qr_id: Uuid,
    pub scanned_at: DateTime<Utc>,
    pub station: String,
}

impl Entity for AttendanceLog {
    const TABLE: Table = Table::AttendanceLogs;
    type Id = i64;

    fn id(&self) -> i64 {
        self.log_id
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn timestamp(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + offset_secs, 0).unwrap()
    }

    pub fn student(id: i64) -> Student {
        Student {
            student_id: id,
            full_name: format!("Student {}", id),
            email: format!("student{}@example.edu", id),
            phone: None,
            institution: Some("Northside High".to_string()),
            group_id: None,
            single_id: None,
            created_at: timestamp(id),
        }
    }

    pub fn guest(id: i64) -> Guest {
        Guest {
            guest_id: id,
            full_name: format!("Guest {}", id),
            email: format!("guest{}@example.com", id),
            phone: None,
            affiliation: None,
            created_at: timestamp(id),
        }
    }

    pub fn group(id: i64) -> Group {
        Group {
            group_id: id,
            group_name: format!("Group {}", id),
            performance_type: PerformanceType::Dance,
            member_ids: vec![],
            created_at: timestamp(id),
        }
    }

    pub fn single(id: i64, student_id: i64) -> Single {
        Single {
            single_id: id,
            student_id,
            performance_type: PerformanceType::Vocal,
            title: None,
            created_at: timestamp(id),
        }
    }

    pub fn qr_code(guest_id: i64) -> QrCode {
        QrCode {
            qr_id: Uuid::new_v4(),
            owner: QrOwner::Guest { guest_id },
            issued_at: timestamp(guest_id),
        }
    }

    pub fn attendance_log(id: i64, qr_id: Uuid) -> AttendanceLog {
        AttendanceLog {
            log_id: id,
            qr_id,
            scanned_at: timestamp(id),
            station: "main-hall".to_string(),
        }
    }
}
