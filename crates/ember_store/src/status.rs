//! Protocol status codes and conditional-operation reject rules.

use serde::{Deserialize, Serialize};

/// Outcome code carried in every response. `Ok` means the operation took
/// effect (or was a recorded duplicate); everything else is a failure the
/// client can act on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    UnknownTablet,
    UnknownIndexlet,
    ObjectDoesntExist,
    ObjectExists,
    WrongVersion,
    InvalidObject,
    RequestFormatError,
    Retry,
    NoTableSpace,
    InternalError,
    UnimplementedRequest,
}

impl Status {
    /// Stable numeric code used inside recorded RPC results.
    pub fn code(self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::UnknownTablet => 1,
            Status::UnknownIndexlet => 2,
            Status::ObjectDoesntExist => 3,
            Status::ObjectExists => 4,
            Status::WrongVersion => 5,
            Status::InvalidObject => 6,
            Status::RequestFormatError => 7,
            Status::Retry => 8,
            Status::NoTableSpace => 9,
            Status::InternalError => 10,
            Status::UnimplementedRequest => 11,
        }
    }

    pub fn from_code(code: u8) -> Option<Status> {
        Some(match code {
            0 => Status::Ok,
            1 => Status::UnknownTablet,
            2 => Status::UnknownIndexlet,
            3 => Status::ObjectDoesntExist,
            4 => Status::ObjectExists,
            5 => Status::WrongVersion,
            6 => Status::InvalidObject,
            7 => Status::RequestFormatError,
            8 => Status::Retry,
            9 => Status::NoTableSpace,
            10 => Status::InternalError,
            11 => Status::UnimplementedRequest,
            _ => return None,
        })
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

/// Conditions under which a read, write, or remove must be rejected.
///
/// `given_version` is only consulted when one of the version flags is set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectRules {
    pub given_version: u64,
    /// Reject if the object does not exist.
    pub doesnt_exist: bool,
    /// Reject if the object exists.
    pub exists: bool,
    /// Reject if the object's version is <= `given_version`.
    pub version_le_given: bool,
    /// Reject if the object's version is != `given_version`.
    pub version_ne_given: bool,
}

impl RejectRules {
    /// Rules for a compare-and-swap against an exact version.
    pub fn exactly_version(version: u64) -> Self {
        RejectRules {
            given_version: version,
            version_ne_given: true,
            ..Default::default()
        }
    }

    /// Evaluate the rules against the current state of an object.
    ///
    /// `version` is meaningless when `exists` is false.
    pub fn check(&self, exists: bool, version: u64) -> Status {
        if !exists {
            if self.doesnt_exist {
                return Status::ObjectDoesntExist;
            }
            return Status::Ok;
        }
        if self.exists {
            return Status::ObjectExists;
        }
        if self.version_le_given && version <= self.given_version {
            return Status::WrongVersion;
        }
        if self.version_ne_given && version != self.given_version {
            return Status::WrongVersion;
        }
        Status::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for code in 0..=11u8 {
            let status = Status::from_code(code).expect("known code");
            assert_eq!(status.code(), code);
        }
        assert_eq!(Status::from_code(200), None);
    }

    #[test]
    fn reject_rules_matrix() {
        let none = RejectRules::default();
        assert_eq!(none.check(false, 0), Status::Ok);
        assert_eq!(none.check(true, 7), Status::Ok);

        let must_exist = RejectRules {
            doesnt_exist: true,
            ..Default::default()
        };
        assert_eq!(must_exist.check(false, 0), Status::ObjectDoesntExist);
        assert_eq!(must_exist.check(true, 1), Status::Ok);

        let must_not_exist = RejectRules {
            exists: true,
            ..Default::default()
        };
        assert_eq!(must_not_exist.check(true, 1), Status::ObjectExists);
        assert_eq!(must_not_exist.check(false, 0), Status::Ok);

        let cas = RejectRules::exactly_version(3);
        assert_eq!(cas.check(true, 3), Status::Ok);
        assert_eq!(cas.check(true, 4), Status::WrongVersion);

        let newer_than = RejectRules {
            given_version: 5,
            version_le_given: true,
            ..Default::default()
        };
        assert_eq!(newer_than.check(true, 5), Status::WrongVersion);
        assert_eq!(newer_than.check(true, 6), Status::Ok);
    }
}
