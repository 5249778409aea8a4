use serde::{Deserialize, Deserializer, Serialize};

/// Lifecycle state shared by donation records and donation requests.
///
/// Stored as the capitalised name (`"Pending"`, `"Approved"`, ...). Parsing is
/// case-insensitive so older lowercase values still load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Status {
    Pending,
    Approved,
    Completed,
    Rejected,
}

impl Status {
    /// Convert from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Some(Status::Pending),
            "approved" => Some(Status::Approved),
            "completed" => Some(Status::Completed),
            "rejected" => Some(Status::Rejected),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "Pending",
            Status::Approved => "Approved",
            Status::Completed => "Completed",
            Status::Rejected => "Rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Rejected)
    }

    /// Transition table for donation records.
    ///
    /// Pending -> Completed is allowed directly for money donations whose
    /// payment settles without an approval step.
    pub fn donation_transition_allowed(from: Status, to: Status) -> bool {
        match (from, to) {
            (Status::Pending, Status::Approved) => true,
            (Status::Pending, Status::Completed) => true,
            (Status::Approved, Status::Completed) => true,
            (Status::Pending, _) => false,
            (Status::Approved, _) => false,
            (Status::Completed, _) => false,
            (Status::Rejected, _) => false,
        }
    }

    /// Transition table for one donor's entry in a request's response
    /// sub-ledger. A donor pledges (Approved) and then delivers (Completed),
    /// or delivers outright; an entry never steps back or repeats.
    pub fn response_transition_allowed(from: Status, to: Status) -> bool {
        match (from, to) {
            (Status::Pending, Status::Approved) => true,
            (Status::Pending, Status::Completed) => true,
            (Status::Approved, Status::Completed) => true,
            (Status::Pending, _) => false,
            (Status::Approved, _) => false,
            (Status::Completed, _) => false,
            (Status::Rejected, _) => false,
        }
    }

    /// Transition table for donation requests.
    ///
    /// Pending -> Completed is accepted for older clients that skip the
    /// approval step; callers log it as a warning.
    pub fn request_transition_allowed(from: Status, to: Status) -> bool {
        match (from, to) {
            (Status::Pending, Status::Approved) => true,
            (Status::Pending, Status::Rejected) => true,
            (Status::Pending, Status::Completed) => true,
            (Status::Approved, Status::Completed) => true,
            (Status::Approved, Status::Rejected) => true,
            (Status::Pending, Status::Pending) => false,
            (Status::Approved, _) => false,
            (Status::Completed, _) => false,
            (Status::Rejected, _) => false,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Status::from_str(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("Invalid status: {}", raw)))
    }
}

impl TryFrom<String> for Status {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value).ok_or_else(|| format!("Invalid status: {}", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Status; 4] = [
        Status::Pending,
        Status::Approved,
        Status::Completed,
        Status::Rejected,
    ];

    #[test]
    fn parses_case_insensitively() {
        assert_eq!(Status::from_str("approved"), Some(Status::Approved));
        assert_eq!(Status::from_str("APPROVED"), Some(Status::Approved));
        assert_eq!(Status::from_str(" Pending "), Some(Status::Pending));
        assert_eq!(Status::from_str("done"), None);
    }

    #[test]
    fn legacy_lowercase_values_deserialize() {
        let s: Status = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(s, Status::Completed);
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"Completed\"");
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for to in ALL {
            assert!(!Status::request_transition_allowed(Status::Completed, to));
            assert!(!Status::request_transition_allowed(Status::Rejected, to));
            assert!(!Status::donation_transition_allowed(Status::Completed, to));
        }
    }

    #[test]
    fn no_transition_is_idempotent() {
        for s in ALL {
            assert!(!Status::request_transition_allowed(s, s));
            assert!(!Status::donation_transition_allowed(s, s));
            assert!(!Status::response_transition_allowed(s, s));
        }
    }

    #[test]
    fn response_table() {
        assert!(Status::response_transition_allowed(Status::Pending, Status::Approved));
        assert!(Status::response_transition_allowed(Status::Pending, Status::Completed));
        assert!(Status::response_transition_allowed(Status::Approved, Status::Completed));
        for from in ALL {
            assert!(!Status::response_transition_allowed(from, Status::Pending));
            assert!(!Status::response_transition_allowed(from, Status::Rejected));
            assert!(!Status::response_transition_allowed(Status::Completed, from));
        }
    }

    #[test]
    fn donations_never_reject() {
        for from in ALL {
            assert!(!Status::donation_transition_allowed(from, Status::Rejected));
        }
    }

    #[test]
    fn request_table() {
        assert!(Status::request_transition_allowed(Status::Pending, Status::Approved));
        assert!(Status::request_transition_allowed(Status::Approved, Status::Completed));
        assert!(Status::request_transition_allowed(Status::Approved, Status::Rejected));
        assert!(!Status::request_transition_allowed(Status::Approved, Status::Pending));
    }
}
