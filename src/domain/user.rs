//! User account payload

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use validator::{Validate, ValidationErrors};

use super::violation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Gender {
    Male,
    Female,
}

impl FromStr for Gender {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MALE" => Ok(Self::Male),
            "FEMALE" => Ok(Self::Female),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    Pending,
    Active,
    Inactive,
    Blocked,
}

impl FromStr for UserStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "ACTIVE" => Ok(Self::Active),
            "INACTIVE" => Ok(Self::Inactive),
            "BLOCKED" => Ok(Self::Blocked),
            _ => Err(()),
        }
    }
}

/// User account as submitted to the user service
///
/// `gender` and `status` stay strings on the wire so an unknown value is
/// reported as a violation rather than a parse failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[validate(required, length(min = 1, max = 100))]
    pub first_name: Option<String>,

    #[validate(required, length(min = 1, max = 100))]
    pub last_name: Option<String>,

    #[validate(required)]
    pub date_of_birth: Option<NaiveDate>,

    #[validate(required)]
    pub gender: Option<String>,

    #[validate(required, email, length(min = 1, max = 100))]
    pub email: Option<String>,

    #[validate(required, length(min = 6, max = 1000))]
    pub password: Option<String>,

    #[validate(required)]
    pub status: Option<String>,

    #[serde(default)]
    pub enabled: bool,
}

impl User {
    /// Run every check, with today's date as the date-of-birth reference
    pub fn check(&self) -> Result<(), ValidationErrors> {
        self.check_at(Utc::now().date_naive())
    }

    /// Run the derived constraints plus the past-date and enum checks
    pub fn check_at(&self, today: NaiveDate) -> Result<(), ValidationErrors> {
        let mut errors = match self.validate() {
            Ok(()) => ValidationErrors::new(),
            Err(errors) => errors,
        };

        if matches!(self.date_of_birth, Some(dob) if dob >= today) {
            errors.add("date_of_birth", violation("past", "must be a past date"));
        }
        if matches!(self.gender.as_deref(), Some(g) if g.parse::<Gender>().is_err()) {
            errors.add("gender", violation("one_of", "must be one of MALE, FEMALE"));
        }
        if matches!(self.status.as_deref(), Some(s) if s.parse::<UserStatus>().is_err()) {
            errors.add(
                "status",
                violation("one_of", "must be one of PENDING, ACTIVE, INACTIVE, BLOCKED"),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
