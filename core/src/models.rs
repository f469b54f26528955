use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MIN_PASSWORD_LEN: usize = 6;
pub const DEFAULT_ROLE: &str = "customer";
pub const DEFAULT_WATER_GOAL_ML: i64 = 2000;
pub const DEFAULT_CALORIE_GOAL: i64 = 2000;

/// Labels of the three meals seeded into every nutrition record, in display order.
pub const MEAL_NAMES: [&str; 3] = ["Breakfast", "Lunch", "Dinner"];

pub const MAX_WATER_AMOUNT_ML: i64 = 5000;
pub const MAX_WATER_GOAL_ML: i64 = 20_000;
pub const MAX_CALORIE_GOAL: i64 = 20_000;
pub const MAX_MEAL_CALORIES: i64 = 10_000;
pub const MAX_WEIGHT_KG: f64 = 500.0;
pub const MAX_HEIGHT_CM: f64 = 300.0;
pub const MAX_PET_AGE: i64 = 100;

// --- Accounts ---

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub role: String,
    pub selected_pet_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A user row together with its stored password hash. Never serialized.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: User,
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

/// Partial profile update. `None` leaves a column untouched; for the nullable
/// columns `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct UpdateUser {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub name: Option<Option<String>>,
    pub phone: Option<Option<String>>,
    pub address: Option<Option<String>>,
}

impl UpdateUser {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.username.is_none()
            && self.email.is_none()
            && self.password_hash.is_none()
            && self.name.is_none()
            && self.phone.is_none()
            && self.address.is_none()
    }
}

// --- Pets ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gender {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "male" => Ok(Self::Male),
            "female" => Ok(Self::Female),
            _ => Err(Error::bad_request(format!(
                "Invalid gender '{s}'. Must be one of: male, female"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Pet {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub species: String,
    pub breed: Option<String>,
    pub age: Option<i64>,
    pub gender: Option<Gender>,
    pub medical_history: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPet {
    pub name: String,
    pub species: String,
    pub breed: Option<String>,
    pub age: Option<i64>,
    pub gender: Option<Gender>,
    pub medical_history: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdatePet {
    pub name: Option<String>,
    pub species: Option<String>,
    pub breed: Option<Option<String>>,
    pub age: Option<Option<i64>>,
    pub gender: Option<Option<Gender>>,
    pub medical_history: Option<Option<String>>,
}

// --- Water ---

#[derive(Debug, Clone, Serialize)]
pub struct WaterIntake {
    pub id: i64,
    pub user_id: i64,
    pub total_intake: i64,
    pub daily_goal: i64,
    pub last_reset_date: Option<DateTime<Utc>>,
    pub progress_pct: f64,
    pub entries: Vec<WaterIntakeEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaterIntakeEntry {
    pub id: i64,
    pub amount: i64,
    pub date: DateTime<Utc>,
}

// --- Sleep ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SleepState {
    Idle,
    Tracking,
}

#[derive(Debug, Clone, Serialize)]
pub struct SleepRecord {
    pub id: i64,
    pub user_id: i64,
    pub state: SleepState,
    pub current_sleep_start: Option<DateTime<Utc>>,
    pub entries: Vec<SleepEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SleepEntry {
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Exact `end_time - start_time`, never negative.
    pub duration_seconds: i64,
    /// `duration_seconds` in whole minutes, truncated.
    pub duration_minutes: i64,
}

impl SleepEntry {
    #[must_use]
    pub fn new(id: i64, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        let duration_seconds = (end_time - start_time).num_seconds().max(0);
        Self {
            id,
            start_time,
            end_time,
            duration_seconds,
            duration_minutes: duration_seconds / 60,
        }
    }
}

// --- Nutrition ---

#[derive(Debug, Clone, Serialize)]
pub struct NutritionRecord {
    pub id: i64,
    pub user_id: i64,
    pub daily_goal: i64,
    pub total_calories: i64,
    pub meals: Vec<Meal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Meal {
    pub id: i64,
    pub name: String,
    pub calories: i64,
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateMeal {
    pub name: Option<String>,
    pub calories: Option<i64>,
    pub time: Option<Option<DateTime<Utc>>>,
}

// --- Progress ---

#[derive(Debug, Clone, Serialize)]
pub struct ProgressRecord {
    pub id: i64,
    pub user_id: i64,
    pub current_weight: f64,
    pub goal_weight: f64,
    pub height: f64,
    pub weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bmi: Option<f64>,
    pub entries: Vec<ProgressEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEntry {
    pub id: i64,
    pub current_weight: f64,
    pub goal_weight: f64,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateProgress {
    pub current_weight: Option<f64>,
    pub goal_weight: Option<f64>,
    pub height: Option<f64>,
    pub weight: Option<f64>,
    /// Append a history snapshot when both weights end up positive.
    pub log_entry: bool,
}

/// Body-mass index from height in centimetres and weight in kilograms,
/// rounded to one decimal. `None` until both are positive.
#[must_use]
pub fn body_mass_index(height_cm: f64, weight_kg: f64) -> Option<f64> {
    if height_cm <= 0.0 || weight_kg <= 0.0 {
        return None;
    }
    let metres = height_cm / 100.0;
    Some((weight_kg / (metres * metres) * 10.0).round() / 10.0)
}

/// Share of the daily goal already reached, capped at 100.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn goal_progress_pct(total: i64, goal: i64) -> f64 {
    if goal <= 0 {
        return 0.0;
    }
    ((total as f64 / goal as f64) * 100.0).min(100.0)
}

// --- Validation ---

/// Trim a required text field and reject it when blank.
pub fn require_text(field: &str, value: Option<&str>) -> Result<String> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(Error::bad_request(format!("{field} is required"))),
    }
}

/// Trim an optional text field, collapsing blank input to `None`.
#[must_use]
pub fn optional_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Accepts `local@domain.tld` shapes and returns the address lowercased.
pub fn validate_email(email: &str) -> Result<String> {
    let email = email.trim();
    let invalid = || Error::bad_request(format!("Invalid email format '{email}'"));

    if email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    let (host, tld) = domain.rsplit_once('.').ok_or_else(invalid)?;
    if host.is_empty() || tld.is_empty() {
        return Err(invalid());
    }
    Ok(email.to_lowercase())
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::bad_request(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn check_int_range(field: &str, value: i64, min: i64, max: i64) -> Result<i64> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(Error::bad_request(format!(
            "{field} must be between {min} and {max}"
        )))
    }
}

fn check_float_range(field: &str, value: f64, max: f64) -> Result<f64> {
    if value.is_finite() && (0.0..=max).contains(&value) {
        Ok(value)
    } else {
        Err(Error::bad_request(format!(
            "{field} must be between 0 and {max}"
        )))
    }
}

pub fn validate_water_amount(amount: i64) -> Result<i64> {
    check_int_range("amount", amount, 1, MAX_WATER_AMOUNT_ML)
}

pub fn validate_water_goal(goal: i64) -> Result<i64> {
    check_int_range("daily_goal", goal, 1, MAX_WATER_GOAL_ML)
}

pub fn validate_calorie_goal(goal: i64) -> Result<i64> {
    check_int_range("daily_goal", goal, 1, MAX_CALORIE_GOAL)
}

pub fn validate_meal_calories(calories: i64) -> Result<i64> {
    check_int_range("calories", calories, 0, MAX_MEAL_CALORIES)
}

pub fn validate_pet_age(age: i64) -> Result<i64> {
    check_int_range("age", age, 0, MAX_PET_AGE)
}

pub fn validate_weight(field: &str, kg: f64) -> Result<f64> {
    check_float_range(field, kg, MAX_WEIGHT_KG)
}

pub fn validate_height(cm: f64) -> Result<f64> {
    check_float_range("height", cm, MAX_HEIGHT_CM)
}

/// Validate every field present in a progress update.
pub fn validate_progress_update(update: &UpdateProgress) -> Result<()> {
    if let Some(v) = update.current_weight {
        validate_weight("current_weight", v)?;
    }
    if let Some(v) = update.goal_weight {
        validate_weight("goal_weight", v)?;
    }
    if let Some(v) = update.weight {
        validate_weight("weight", v)?;
    }
    if let Some(v) = update.height {
        validate_height(v)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_email_accepts_common_shapes() {
        assert_eq!(validate_email("a@x.com").unwrap(), "a@x.com");
        assert_eq!(
            validate_email("  Alice.Smith@Mail.Example.org ").unwrap(),
            "alice.smith@mail.example.org"
        );
    }

    #[test]
    fn test_validate_email_rejects_bad_shapes() {
        for bad in ["", "alice", "@x.com", "a@", "a@x", "a@.com", "a@x.", "a b@x.com", "a@b@c.com"] {
            assert!(validate_email(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_validate_password_length() {
        assert!(validate_password("secret").is_ok());
        assert!(validate_password("short").is_err());
        // counted in characters, not bytes
        assert!(validate_password("пароль").is_ok());
    }

    #[test]
    fn test_require_text() {
        assert_eq!(require_text("name", Some("  Rex ")).unwrap(), "Rex");
        let err = require_text("name", Some("   ")).unwrap_err();
        assert_eq!(err.to_string(), "name is required");
        assert!(require_text("name", None).is_err());
    }

    #[test]
    fn test_optional_text_collapses_blank() {
        assert_eq!(optional_text(Some("  ".to_string())), None);
        assert_eq!(optional_text(Some(" x ".to_string())).as_deref(), Some("x"));
        assert_eq!(optional_text(None), None);
    }

    #[test]
    fn test_gender_parse() {
        assert_eq!("male".parse::<Gender>().unwrap(), Gender::Male);
        assert_eq!("Female".parse::<Gender>().unwrap(), Gender::Female);
        assert!("cat".parse::<Gender>().is_err());
    }

    #[test]
    fn test_numeric_bounds() {
        assert!(validate_water_amount(0).is_err());
        assert!(validate_water_amount(-5).is_err());
        assert_eq!(validate_water_amount(250).unwrap(), 250);
        assert!(validate_water_amount(MAX_WATER_AMOUNT_ML + 1).is_err());

        assert!(validate_meal_calories(0).is_ok());
        assert!(validate_meal_calories(-1).is_err());
        assert!(validate_calorie_goal(0).is_err());

        assert!(validate_weight("weight", -0.1).is_err());
        assert!(validate_weight("weight", f64::NAN).is_err());
        assert!(validate_height(301.0).is_err());
        assert!(validate_pet_age(101).is_err());
    }

    #[test]
    fn test_validate_progress_update_checks_present_fields_only() {
        let ok = UpdateProgress {
            current_weight: Some(80.0),
            ..UpdateProgress::default()
        };
        assert!(validate_progress_update(&ok).is_ok());

        let bad = UpdateProgress {
            height: Some(-1.0),
            ..UpdateProgress::default()
        };
        let err = validate_progress_update(&bad).unwrap_err();
        assert!(err.to_string().contains("height"));
    }

    #[test]
    fn test_body_mass_index() {
        assert_eq!(body_mass_index(180.0, 81.0), Some(25.0));
        assert_eq!(body_mass_index(0.0, 81.0), None);
        assert_eq!(body_mass_index(180.0, 0.0), None);
    }

    #[test]
    fn test_goal_progress_pct_caps_at_100() {
        assert!((goal_progress_pct(500, 2000) - 25.0).abs() < f64::EPSILON);
        assert!((goal_progress_pct(5000, 2000) - 100.0).abs() < f64::EPSILON);
        assert!(goal_progress_pct(100, 0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_serialization() {
        let record = ProgressRecord {
            id: 1,
            user_id: 1,
            current_weight: 0.0,
            goal_weight: 0.0,
            height: 0.0,
            weight: 0.0,
            bmi: None,
            entries: Vec::new(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("bmi").is_none());

        assert_eq!(serde_json::to_value(Gender::Female).unwrap(), "female");
        assert_eq!(serde_json::to_value(SleepState::Tracking).unwrap(), "tracking");
        let gender: Gender = serde_json::from_str("\"male\"").unwrap();
        assert_eq!(gender, Gender::Male);
    }

    #[test]
    fn test_update_user_is_empty() {
        assert!(UpdateUser::default().is_empty());
        let update = UpdateUser {
            phone: Some(None),
            ..UpdateUser::default()
        };
        assert!(!update.is_empty());
    }
}
