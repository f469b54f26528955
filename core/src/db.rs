use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::auth::Identity;
use crate::error::{Error, Result};
use crate::models::{
    Credentials, DEFAULT_CALORIE_GOAL, DEFAULT_ROLE, DEFAULT_WATER_GOAL_ML, Gender, MEAL_NAMES,
    Meal, NewPet, NewUser, NutritionRecord, Pet, ProgressEntry, ProgressRecord, SleepEntry,
    SleepRecord, SleepState, UpdateMeal, UpdatePet, UpdateProgress, UpdateUser, User, WaterIntake,
    WaterIntakeEntry, body_mass_index, goal_progress_pct, require_text, validate_calorie_goal,
    validate_meal_calories, validate_pet_age, validate_progress_update, validate_water_amount,
    validate_water_goal,
};
use crate::ownership::{authorize, authorize_self};

const USER_COLUMNS: &str =
    "id, username, email, name, phone, address, role, selected_pet_id, created_at";
const PET_COLUMNS: &str =
    "id, owner_id, name, species, breed, age, gender, medical_history, created_at";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL UNIQUE COLLATE NOCASE,
                    email TEXT NOT NULL UNIQUE,
                    password_hash TEXT NOT NULL,
                    name TEXT,
                    phone TEXT,
                    address TEXT,
                    role TEXT NOT NULL DEFAULT 'customer',
                    selected_pet_id INTEGER REFERENCES pets(id),
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS pets (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner_id INTEGER NOT NULL REFERENCES users(id),
                    name TEXT NOT NULL,
                    species TEXT NOT NULL,
                    breed TEXT,
                    age INTEGER,
                    gender TEXT CHECK (gender IN ('male', 'female')),
                    medical_history TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS water_intakes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL UNIQUE REFERENCES users(id),
                    total_intake INTEGER NOT NULL DEFAULT 0,
                    daily_goal INTEGER NOT NULL DEFAULT 2000,
                    last_reset_date TEXT
                );

                CREATE TABLE IF NOT EXISTS water_intake_entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    water_intake_id INTEGER NOT NULL REFERENCES water_intakes(id),
                    amount INTEGER NOT NULL,
                    date TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sleep_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL UNIQUE REFERENCES users(id),
                    current_sleep_start TEXT
                );

                CREATE TABLE IF NOT EXISTS sleep_entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    sleep_record_id INTEGER NOT NULL REFERENCES sleep_records(id),
                    start_time TEXT NOT NULL,
                    end_time TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS nutrition_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL UNIQUE REFERENCES users(id),
                    daily_goal INTEGER NOT NULL DEFAULT 2000
                );

                CREATE TABLE IF NOT EXISTS meals (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    nutrition_record_id INTEGER NOT NULL REFERENCES nutrition_records(id),
                    name TEXT NOT NULL,
                    calories INTEGER NOT NULL DEFAULT 0,
                    time TEXT
                );

                CREATE TABLE IF NOT EXISTS progress_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL UNIQUE REFERENCES users(id),
                    current_weight REAL NOT NULL DEFAULT 0,
                    goal_weight REAL NOT NULL DEFAULT 0,
                    height REAL NOT NULL DEFAULT 0,
                    weight REAL NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS progress_entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    progress_record_id INTEGER NOT NULL REFERENCES progress_records(id),
                    current_weight REAL NOT NULL,
                    goal_weight REAL NOT NULL,
                    date TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_pets_owner ON pets(owner_id);
                CREATE INDEX IF NOT EXISTS idx_water_entries_record ON water_intake_entries(water_intake_id);
                CREATE INDEX IF NOT EXISTS idx_sleep_entries_record ON sleep_entries(sleep_record_id);
                CREATE INDEX IF NOT EXISTS idx_meals_record ON meals(nutrition_record_id);
                CREATE INDEX IF NOT EXISTS idx_progress_entries_record ON progress_entries(progress_record_id);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn user_from_row(row: &rusqlite::Row) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            username: row.get(1)?,
            email: row.get(2)?,
            name: row.get(3)?,
            phone: row.get(4)?,
            address: row.get(5)?,
            role: row.get(6)?,
            selected_pet_id: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn pet_from_row(row: &rusqlite::Row) -> rusqlite::Result<Pet> {
        let gender: Option<String> = row.get(6)?;
        Ok(Pet {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            species: row.get(3)?,
            breed: row.get(4)?,
            age: row.get(5)?,
            // CHECK constraint keeps this column to the two known values
            gender: gender.and_then(|g| g.parse::<Gender>().ok()),
            medical_history: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    // --- Users ---

    /// Insert a user and seed the four health aggregates in one transaction.
    pub fn create_user(&self, new: &NewUser, now: DateTime<Utc>) -> Result<User> {
        let tx = self.conn.unchecked_transaction()?;

        if username_taken(&tx, &new.username, None)? {
            return Err(Error::conflict("Username already taken"));
        }
        if email_taken(&tx, &new.email, None)? {
            return Err(Error::conflict("Email already registered"));
        }

        tx.execute(
            "INSERT INTO users (username, email, password_hash, name, phone, address, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.username,
                new.email,
                new.password_hash,
                new.name,
                new.phone,
                new.address,
                DEFAULT_ROLE,
                now,
            ],
        )
        .map_err(|e| unique_conflict(e, "Username or email already registered"))?;
        let user_id = tx.last_insert_rowid();
        seed_health_records(&tx, user_id, now)?;
        tx.commit()?;

        tracing::info!(user_id, "user registered");
        self.require_user(user_id)
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        user_by_id(&self.conn, id)
    }

    fn require_user(&self, id: i64) -> Result<User> {
        self.get_user(id)?
            .ok_or_else(|| Error::not_found("User not found"))
    }

    pub fn user_exists(&self, id: i64) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?)
    }

    /// Look up a user by (already normalised) email along with the password hash.
    pub fn find_credentials(&self, email: &str) -> Result<Option<Credentials>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {USER_COLUMNS}, password_hash FROM users WHERE email = ?1"),
                params![email],
                |row| {
                    Ok(Credentials {
                        user: Self::user_from_row(row)?,
                        password_hash: row.get(9)?,
                    })
                },
            )
            .optional()?)
    }

    /// Profile of `user_id`, visible only to that user.
    pub fn user_profile(&self, identity: Identity, user_id: i64) -> Result<User> {
        authorize_self(identity, user_id)?;
        self.require_user(user_id)
    }

    pub fn update_user(&self, identity: Identity, user_id: i64, update: &UpdateUser) -> Result<User> {
        authorize_self(identity, user_id)?;
        if update.is_empty() {
            return Err(Error::bad_request("At least one field must be provided"));
        }

        let tx = self.conn.unchecked_transaction()?;
        authorize(identity, user_by_id(&tx, user_id)?)?;

        if let Some(ref username) = update.username {
            if username_taken(&tx, username, Some(user_id))? {
                return Err(Error::conflict("Username already taken"));
            }
            tx.execute(
                "UPDATE users SET username = ?1 WHERE id = ?2",
                params![username, user_id],
            )
            .map_err(|e| unique_conflict(e, "Username already taken"))?;
        }
        if let Some(ref email) = update.email {
            if email_taken(&tx, email, Some(user_id))? {
                return Err(Error::conflict("Email already registered"));
            }
            tx.execute(
                "UPDATE users SET email = ?1 WHERE id = ?2",
                params![email, user_id],
            )
            .map_err(|e| unique_conflict(e, "Email already registered"))?;
        }
        if let Some(ref hash) = update.password_hash {
            tx.execute(
                "UPDATE users SET password_hash = ?1 WHERE id = ?2",
                params![hash, user_id],
            )?;
        }
        if let Some(ref name) = update.name {
            tx.execute(
                "UPDATE users SET name = ?1 WHERE id = ?2",
                params![name, user_id],
            )?;
        }
        if let Some(ref phone) = update.phone {
            tx.execute(
                "UPDATE users SET phone = ?1 WHERE id = ?2",
                params![phone, user_id],
            )?;
        }
        if let Some(ref address) = update.address {
            tx.execute(
                "UPDATE users SET address = ?1 WHERE id = ?2",
                params![address, user_id],
            )?;
        }

        tx.commit()?;
        self.require_user(user_id)
    }

    /// Remove a user and everything they own, children before parents.
    pub fn delete_user(&self, identity: Identity, user_id: i64) -> Result<()> {
        authorize_self(identity, user_id)?;

        let tx = self.conn.unchecked_transaction()?;
        authorize(identity, user_by_id(&tx, user_id)?)?;

        tx.execute(
            "UPDATE users SET selected_pet_id = NULL
             WHERE id = ?1 OR selected_pet_id IN (SELECT id FROM pets WHERE owner_id = ?1)",
            params![user_id],
        )?;
        tx.execute("DELETE FROM pets WHERE owner_id = ?1", params![user_id])?;
        tx.execute(
            "DELETE FROM water_intake_entries
             WHERE water_intake_id IN (SELECT id FROM water_intakes WHERE user_id = ?1)",
            params![user_id],
        )?;
        tx.execute("DELETE FROM water_intakes WHERE user_id = ?1", params![user_id])?;
        tx.execute(
            "DELETE FROM sleep_entries
             WHERE sleep_record_id IN (SELECT id FROM sleep_records WHERE user_id = ?1)",
            params![user_id],
        )?;
        tx.execute("DELETE FROM sleep_records WHERE user_id = ?1", params![user_id])?;
        tx.execute(
            "DELETE FROM meals
             WHERE nutrition_record_id IN (SELECT id FROM nutrition_records WHERE user_id = ?1)",
            params![user_id],
        )?;
        tx.execute(
            "DELETE FROM nutrition_records WHERE user_id = ?1",
            params![user_id],
        )?;
        tx.execute(
            "DELETE FROM progress_entries
             WHERE progress_record_id IN (SELECT id FROM progress_records WHERE user_id = ?1)",
            params![user_id],
        )?;
        tx.execute(
            "DELETE FROM progress_records WHERE user_id = ?1",
            params![user_id],
        )?;
        tx.execute("DELETE FROM users WHERE id = ?1", params![user_id])?;

        tx.commit()?;
        tracing::info!(user_id, "user deleted");
        Ok(())
    }

    /// Point the caller's profile at one of their own pets.
    pub fn select_pet(&self, identity: Identity, pet_id: i64) -> Result<User> {
        let tx = self.conn.unchecked_transaction()?;
        let pet = authorize(identity, pet_by_id(&tx, pet_id)?)?;
        tx.execute(
            "UPDATE users SET selected_pet_id = ?1 WHERE id = ?2",
            params![pet.id, identity.user_id()],
        )?;
        tx.commit()?;
        self.require_user(identity.user_id())
    }

    // --- Pets ---

    pub fn insert_pet(&self, identity: Identity, pet: &NewPet, now: DateTime<Utc>) -> Result<Pet> {
        if let Some(age) = pet.age {
            validate_pet_age(age)?;
        }
        self.conn.execute(
            "INSERT INTO pets (owner_id, name, species, breed, age, gender, medical_history, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                identity.user_id(),
                pet.name,
                pet.species,
                pet.breed,
                pet.age,
                pet.gender.map(Gender::as_str),
                pet.medical_history,
                now,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        pet_by_id(&self.conn, id)?.ok_or_else(|| Error::not_found("Pet not found"))
    }

    pub fn get_pet(&self, id: i64) -> Result<Option<Pet>> {
        pet_by_id(&self.conn, id)
    }

    /// A pet the caller owns: `NotFound` when missing, `Forbidden` otherwise.
    pub fn owned_pet(&self, identity: Identity, id: i64) -> Result<Pet> {
        authorize(identity, self.get_pet(id)?)
    }

    pub fn pets_for_owner(&self, identity: Identity, owner_id: i64) -> Result<Vec<Pet>> {
        authorize_self(identity, owner_id)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PET_COLUMNS} FROM pets WHERE owner_id = ?1 ORDER BY id"
        ))?;
        let pets = stmt
            .query_map(params![owner_id], Self::pet_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pets)
    }

    pub fn update_pet(&self, identity: Identity, id: i64, update: &UpdatePet) -> Result<Pet> {
        if let Some(Some(age)) = update.age {
            validate_pet_age(age)?;
        }

        let tx = self.conn.unchecked_transaction()?;
        authorize(identity, pet_by_id(&tx, id)?)?;

        if let Some(ref name) = update.name {
            let name = require_text("name", Some(name.as_str()))?;
            tx.execute("UPDATE pets SET name = ?1 WHERE id = ?2", params![name, id])?;
        }
        if let Some(ref species) = update.species {
            let species = require_text("species", Some(species.as_str()))?;
            tx.execute(
                "UPDATE pets SET species = ?1 WHERE id = ?2",
                params![species, id],
            )?;
        }
        if let Some(ref breed) = update.breed {
            tx.execute("UPDATE pets SET breed = ?1 WHERE id = ?2", params![breed, id])?;
        }
        if let Some(age) = update.age {
            tx.execute("UPDATE pets SET age = ?1 WHERE id = ?2", params![age, id])?;
        }
        if let Some(gender) = update.gender {
            tx.execute(
                "UPDATE pets SET gender = ?1 WHERE id = ?2",
                params![gender.map(Gender::as_str), id],
            )?;
        }
        if let Some(ref history) = update.medical_history {
            tx.execute(
                "UPDATE pets SET medical_history = ?1 WHERE id = ?2",
                params![history, id],
            )?;
        }

        let pet = pet_by_id(&tx, id)?.ok_or_else(|| Error::not_found("Pet not found"))?;
        tx.commit()?;
        Ok(pet)
    }

    pub fn delete_pet(&self, identity: Identity, id: i64) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        authorize(identity, pet_by_id(&tx, id)?)?;
        tx.execute(
            "UPDATE users SET selected_pet_id = NULL WHERE selected_pet_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM pets WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    // --- Water ---

    pub fn water(&self, identity: Identity) -> Result<WaterIntake> {
        let (id, total_intake, daily_goal, last_reset_date): (i64, i64, i64, Option<DateTime<Utc>>) = self
            .conn
            .query_row(
                "SELECT id, total_intake, daily_goal, last_reset_date
                 FROM water_intakes WHERE user_id = ?1",
                params![identity.user_id()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?
            .ok_or_else(|| Error::not_found("Water record not found"))?;

        let mut stmt = self.conn.prepare(
            "SELECT id, amount, date FROM water_intake_entries
             WHERE water_intake_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![id], |row| {
                Ok(WaterIntakeEntry {
                    id: row.get(0)?,
                    amount: row.get(1)?,
                    date: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(WaterIntake {
            id,
            user_id: identity.user_id(),
            total_intake,
            daily_goal,
            last_reset_date,
            progress_pct: goal_progress_pct(total_intake, daily_goal),
            entries,
        })
    }

    /// Append an entry and bump the running total in the same transaction.
    /// The total is incremented in SQL, never read back and rewritten.
    pub fn add_water(&self, identity: Identity, amount: i64, now: DateTime<Utc>) -> Result<WaterIntake> {
        let amount = validate_water_amount(amount)?;

        let tx = self.conn.unchecked_transaction()?;
        let id = record_id(&tx, "water_intakes", identity)?;
        tx.execute(
            "INSERT INTO water_intake_entries (water_intake_id, amount, date) VALUES (?1, ?2, ?3)",
            params![id, amount, now],
        )?;
        tx.execute(
            "UPDATE water_intakes SET total_intake = total_intake + ?1 WHERE id = ?2",
            params![amount, id],
        )?;
        tx.commit()?;

        self.water(identity)
    }

    pub fn set_water_goal(&self, identity: Identity, goal: i64) -> Result<WaterIntake> {
        let goal = validate_water_goal(goal)?;
        let id = record_id(&self.conn, "water_intakes", identity)?;
        self.conn.execute(
            "UPDATE water_intakes SET daily_goal = ?1 WHERE id = ?2",
            params![goal, id],
        )?;
        self.water(identity)
    }

    pub fn reset_water(&self, identity: Identity, now: DateTime<Utc>) -> Result<WaterIntake> {
        let tx = self.conn.unchecked_transaction()?;
        let id = record_id(&tx, "water_intakes", identity)?;
        tx.execute(
            "DELETE FROM water_intake_entries WHERE water_intake_id = ?1",
            params![id],
        )?;
        tx.execute(
            "UPDATE water_intakes SET total_intake = 0, last_reset_date = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        tx.commit()?;

        self.water(identity)
    }

    // --- Sleep ---

    pub fn sleep(&self, identity: Identity) -> Result<SleepRecord> {
        let (id, current_sleep_start) = sleep_state(&self.conn, identity)?;

        let mut stmt = self.conn.prepare(
            "SELECT id, start_time, end_time FROM sleep_entries
             WHERE sleep_record_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![id], |row| {
                Ok(SleepEntry::new(row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(SleepRecord {
            id,
            user_id: identity.user_id(),
            state: if current_sleep_start.is_some() {
                SleepState::Tracking
            } else {
                SleepState::Idle
            },
            current_sleep_start,
            entries,
        })
    }

    /// Idle -> Tracking. An already open session has its start overwritten.
    pub fn start_sleep(&self, identity: Identity, now: DateTime<Utc>) -> Result<SleepRecord> {
        let tx = self.conn.unchecked_transaction()?;
        let (id, current) = sleep_state(&tx, identity)?;
        if let Some(previous) = current {
            tracing::warn!(
                user_id = identity.user_id(),
                %previous,
                "sleep session already open, restarting"
            );
        }
        tx.execute(
            "UPDATE sleep_records SET current_sleep_start = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        tx.commit()?;

        self.sleep(identity)
    }

    /// Tracking -> Idle, recording the closed session.
    pub fn end_sleep(&self, identity: Identity, now: DateTime<Utc>) -> Result<SleepEntry> {
        let tx = self.conn.unchecked_transaction()?;
        let (id, current) = sleep_state(&tx, identity)?;
        let start = current.ok_or(Error::NoActiveSession)?;
        // a clock that moved backwards must not yield a negative duration
        let end = now.max(start);

        tx.execute(
            "INSERT INTO sleep_entries (sleep_record_id, start_time, end_time) VALUES (?1, ?2, ?3)",
            params![id, start, end],
        )?;
        let entry_id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE sleep_records SET current_sleep_start = NULL WHERE id = ?1",
            params![id],
        )?;
        tx.commit()?;

        Ok(SleepEntry::new(entry_id, start, end))
    }

    pub fn reset_sleep(&self, identity: Identity) -> Result<SleepRecord> {
        let tx = self.conn.unchecked_transaction()?;
        let id = record_id(&tx, "sleep_records", identity)?;
        tx.execute(
            "DELETE FROM sleep_entries WHERE sleep_record_id = ?1",
            params![id],
        )?;
        tx.execute(
            "UPDATE sleep_records SET current_sleep_start = NULL WHERE id = ?1",
            params![id],
        )?;
        tx.commit()?;

        self.sleep(identity)
    }

    // --- Nutrition ---

    pub fn nutrition(&self, identity: Identity) -> Result<NutritionRecord> {
        let (id, daily_goal): (i64, i64) = self
            .conn
            .query_row(
                "SELECT id, daily_goal FROM nutrition_records WHERE user_id = ?1",
                params![identity.user_id()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| Error::not_found("Nutrition record not found"))?;

        let mut stmt = self.conn.prepare(
            "SELECT id, name, calories, time FROM meals
             WHERE nutrition_record_id = ?1 ORDER BY id",
        )?;
        let meals = stmt
            .query_map(params![id], |row| {
                Ok(Meal {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    calories: row.get(2)?,
                    time: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(NutritionRecord {
            id,
            user_id: identity.user_id(),
            daily_goal,
            total_calories: meals.iter().map(|m| m.calories).sum(),
            meals,
        })
    }

    /// Update one of the caller's meals. A meal belonging to another record is
    /// reported as missing.
    pub fn update_meal(&self, identity: Identity, meal_id: i64, update: &UpdateMeal) -> Result<NutritionRecord> {
        if update.name.is_none() && update.calories.is_none() && update.time.is_none() {
            return Err(Error::bad_request("At least one field must be provided"));
        }
        if let Some(calories) = update.calories {
            validate_meal_calories(calories)?;
        }

        let tx = self.conn.unchecked_transaction()?;
        let owned: Option<i64> = tx
            .query_row(
                "SELECT m.id FROM meals m
                 JOIN nutrition_records n ON n.id = m.nutrition_record_id
                 WHERE m.id = ?1 AND n.user_id = ?2",
                params![meal_id, identity.user_id()],
                |row| row.get(0),
            )
            .optional()?;
        if owned.is_none() {
            return Err(Error::not_found(format!("Meal {meal_id} not found")));
        }

        if let Some(ref name) = update.name {
            let name = require_text("name", Some(name.as_str()))?;
            tx.execute(
                "UPDATE meals SET name = ?1 WHERE id = ?2",
                params![name, meal_id],
            )?;
        }
        if let Some(calories) = update.calories {
            tx.execute(
                "UPDATE meals SET calories = ?1 WHERE id = ?2",
                params![calories, meal_id],
            )?;
        }
        if let Some(time) = update.time {
            tx.execute(
                "UPDATE meals SET time = ?1 WHERE id = ?2",
                params![time, meal_id],
            )?;
        }
        tx.commit()?;

        self.nutrition(identity)
    }

    pub fn set_calorie_goal(&self, identity: Identity, goal: i64) -> Result<NutritionRecord> {
        let goal = validate_calorie_goal(goal)?;
        let id = record_id(&self.conn, "nutrition_records", identity)?;
        self.conn.execute(
            "UPDATE nutrition_records SET daily_goal = ?1 WHERE id = ?2",
            params![goal, id],
        )?;
        self.nutrition(identity)
    }

    /// Zero every meal in place; the three meal rows keep their ids.
    pub fn reset_nutrition(&self, identity: Identity) -> Result<NutritionRecord> {
        let id = record_id(&self.conn, "nutrition_records", identity)?;
        self.conn.execute(
            "UPDATE meals SET calories = 0, time = NULL WHERE nutrition_record_id = ?1",
            params![id],
        )?;
        self.nutrition(identity)
    }

    // --- Progress ---

    pub fn progress(&self, identity: Identity) -> Result<ProgressRecord> {
        let (id, current_weight, goal_weight, height, weight): (i64, f64, f64, f64, f64) = self
            .conn
            .query_row(
                "SELECT id, current_weight, goal_weight, height, weight
                 FROM progress_records WHERE user_id = ?1",
                params![identity.user_id()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?
            .ok_or_else(|| Error::not_found("Progress record not found"))?;

        let mut stmt = self.conn.prepare(
            "SELECT id, current_weight, goal_weight, date FROM progress_entries
             WHERE progress_record_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![id], |row| {
                Ok(ProgressEntry {
                    id: row.get(0)?,
                    current_weight: row.get(1)?,
                    goal_weight: row.get(2)?,
                    date: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(ProgressRecord {
            id,
            user_id: identity.user_id(),
            current_weight,
            goal_weight,
            height,
            weight,
            bmi: body_mass_index(height, weight),
            entries,
        })
    }

    /// Apply the present fields; returns the snapshot and whether a history
    /// entry was appended.
    pub fn update_progress(
        &self,
        identity: Identity,
        update: &UpdateProgress,
        now: DateTime<Utc>,
    ) -> Result<(ProgressRecord, bool)> {
        validate_progress_update(update)?;

        let tx = self.conn.unchecked_transaction()?;
        let id = record_id(&tx, "progress_records", identity)?;

        if let Some(v) = update.current_weight {
            tx.execute(
                "UPDATE progress_records SET current_weight = ?1 WHERE id = ?2",
                params![v, id],
            )?;
        }
        if let Some(v) = update.goal_weight {
            tx.execute(
                "UPDATE progress_records SET goal_weight = ?1 WHERE id = ?2",
                params![v, id],
            )?;
        }
        if let Some(v) = update.height {
            tx.execute(
                "UPDATE progress_records SET height = ?1 WHERE id = ?2",
                params![v, id],
            )?;
        }
        if let Some(v) = update.weight {
            tx.execute(
                "UPDATE progress_records SET weight = ?1 WHERE id = ?2",
                params![v, id],
            )?;
        }

        let mut logged = false;
        if update.log_entry {
            let (current, goal): (f64, f64) = tx.query_row(
                "SELECT current_weight, goal_weight FROM progress_records WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if current > 0.0 && goal > 0.0 {
                tx.execute(
                    "INSERT INTO progress_entries (progress_record_id, current_weight, goal_weight, date)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, current, goal, now],
                )?;
                logged = true;
            }
        }
        tx.commit()?;

        Ok((self.progress(identity)?, logged))
    }

    pub fn reset_progress(&self, identity: Identity) -> Result<ProgressRecord> {
        let tx = self.conn.unchecked_transaction()?;
        let id = record_id(&tx, "progress_records", identity)?;
        tx.execute(
            "DELETE FROM progress_entries WHERE progress_record_id = ?1",
            params![id],
        )?;
        tx.execute(
            "UPDATE progress_records
             SET current_weight = 0, goal_weight = 0, height = 0, weight = 0
             WHERE id = ?1",
            params![id],
        )?;
        tx.commit()?;

        self.progress(identity)
    }
}

// --- Statement helpers shared by the connection and open transactions ---

fn unique_conflict(err: rusqlite::Error, msg: &str) -> Error {
    let err = Error::from(err);
    if err.is_constraint_violation() {
        Error::conflict(msg)
    } else {
        err
    }
}

fn username_taken(conn: &Connection, username: &str, except: Option<i64>) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1 AND id IS NOT ?2)",
        params![username, except],
        |row| row.get(0),
    )?)
}

fn email_taken(conn: &Connection, email: &str, except: Option<i64>) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE email = ?1 AND id IS NOT ?2)",
        params![email, except],
        |row| row.get(0),
    )?)
}

fn user_by_id(conn: &Connection, id: i64) -> Result<Option<User>> {
    Ok(conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id],
            Database::user_from_row,
        )
        .optional()?)
}

fn pet_by_id(conn: &Connection, id: i64) -> Result<Option<Pet>> {
    Ok(conn
        .query_row(
            &format!("SELECT {PET_COLUMNS} FROM pets WHERE id = ?1"),
            params![id],
            Database::pet_from_row,
        )
        .optional()?)
}

/// Id of the caller's row in one of the per-user aggregate tables.
fn record_id(conn: &Connection, table: &str, identity: Identity) -> Result<i64> {
    conn.query_row(
        &format!("SELECT id FROM {table} WHERE user_id = ?1"),
        params![identity.user_id()],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| Error::not_found(format!("No {table} row for user {}", identity.user_id())))
}

fn sleep_state(conn: &Connection, identity: Identity) -> Result<(i64, Option<DateTime<Utc>>)> {
    conn.query_row(
        "SELECT id, current_sleep_start FROM sleep_records WHERE user_id = ?1",
        params![identity.user_id()],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()?
    .ok_or_else(|| Error::not_found("Sleep record not found"))
}

fn seed_health_records(conn: &Connection, user_id: i64, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO water_intakes (user_id, total_intake, daily_goal, last_reset_date)
         VALUES (?1, 0, ?2, ?3)",
        params![user_id, DEFAULT_WATER_GOAL_ML, now],
    )?;
    conn.execute(
        "INSERT INTO sleep_records (user_id) VALUES (?1)",
        params![user_id],
    )?;
    conn.execute(
        "INSERT INTO nutrition_records (user_id, daily_goal) VALUES (?1, ?2)",
        params![user_id, DEFAULT_CALORIE_GOAL],
    )?;
    let nutrition_id = conn.last_insert_rowid();
    for name in MEAL_NAMES {
        conn.execute(
            "INSERT INTO meals (nutrition_record_id, name, calories) VALUES (?1, ?2, 0)",
            params![nutrition_id, name],
        )?;
    }
    conn.execute(
        "INSERT INTO progress_records (user_id) VALUES (?1)",
        params![user_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, hour, minute, 0).unwrap()
    }

    fn new_user(username: &str, email: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            email: email.to_string(),
            password_hash: "$2b$04$not-a-real-hash".to_string(),
            name: None,
            phone: None,
            address: None,
        }
    }

    fn register(db: &Database, username: &str) -> Identity {
        let user = db
            .create_user(&new_user(username, &format!("{username}@x.com")), at(8, 0))
            .unwrap();
        Identity::new(user.id)
    }

    fn sample_pet() -> NewPet {
        NewPet {
            name: "Rex".to_string(),
            species: "dog".to_string(),
            breed: Some("Beagle".to_string()),
            age: Some(3),
            gender: Some(Gender::Male),
            medical_history: None,
        }
    }

    fn count(db: &Database, sql: &str) -> i64 {
        db.conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    // --- Users ---

    #[test]
    fn test_create_user_seeds_health_records() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");

        let user = db.get_user(alice.user_id()).unwrap().unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.role, DEFAULT_ROLE);
        assert_eq!(user.selected_pet_id, None);

        let water = db.water(alice).unwrap();
        assert_eq!(water.total_intake, 0);
        assert_eq!(water.daily_goal, DEFAULT_WATER_GOAL_ML);

        let nutrition = db.nutrition(alice).unwrap();
        let names: Vec<&str> = nutrition.meals.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, MEAL_NAMES);

        assert_eq!(db.sleep(alice).unwrap().state, SleepState::Idle);
        assert!(db.progress(alice).unwrap().entries.is_empty());
    }

    #[test]
    fn test_duplicate_username_conflicts_without_new_row() {
        let db = Database::open_in_memory().unwrap();
        register(&db, "alice");

        let err = db
            .create_user(&new_user("ALICE", "other@x.com"), at(9, 0))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(ref m) if m == "Username already taken"));
        assert_eq!(count(&db, "SELECT COUNT(*) FROM users"), 1);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM water_intakes"), 1);
    }

    #[test]
    fn test_duplicate_email_conflicts_without_new_row() {
        let db = Database::open_in_memory().unwrap();
        register(&db, "alice");

        let err = db
            .create_user(&new_user("bob", "alice@x.com"), at(9, 0))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(ref m) if m == "Email already registered"));
        assert_eq!(count(&db, "SELECT COUNT(*) FROM users"), 1);
    }

    #[test]
    fn test_find_credentials() {
        let db = Database::open_in_memory().unwrap();
        register(&db, "alice");

        let creds = db.find_credentials("alice@x.com").unwrap().unwrap();
        assert_eq!(creds.user.username, "alice");
        assert_eq!(creds.password_hash, "$2b$04$not-a-real-hash");
        assert!(db.find_credentials("nobody@x.com").unwrap().is_none());
    }

    #[test]
    fn test_update_user_partial_fields() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        let id = alice.user_id();

        db.update_user(
            alice,
            id,
            &UpdateUser {
                name: Some(Some("Alice".to_string())),
                phone: Some(Some("555-0100".to_string())),
                ..UpdateUser::default()
            },
        )
        .unwrap();

        // absent fields keep their value, explicit null clears
        let user = db
            .update_user(
                alice,
                id,
                &UpdateUser {
                    phone: Some(None),
                    ..UpdateUser::default()
                },
            )
            .unwrap();
        assert_eq!(user.name.as_deref(), Some("Alice"));
        assert_eq!(user.phone, None);
        assert_eq!(user.email, "alice@x.com");
    }

    #[test]
    fn test_update_user_email_conflict() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        register(&db, "bob");

        let err = db
            .update_user(
                alice,
                alice.user_id(),
                &UpdateUser {
                    email: Some("bob@x.com".to_string()),
                    ..UpdateUser::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // keeping your own email is not a conflict
        db.update_user(
            alice,
            alice.user_id(),
            &UpdateUser {
                email: Some("alice@x.com".to_string()),
                ..UpdateUser::default()
            },
        )
        .unwrap();
    }

    #[test]
    fn test_update_user_rejects_other_account_and_empty_update() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        let bob = register(&db, "bob");

        let err = db
            .update_user(
                alice,
                bob.user_id(),
                &UpdateUser {
                    name: Some(Some("Mallory".to_string())),
                    ..UpdateUser::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        assert_eq!(db.get_user(bob.user_id()).unwrap().unwrap().name, None);

        let err = db
            .update_user(alice, alice.user_id(), &UpdateUser::default())
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn test_delete_user_removes_everything_owned() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        let bob = register(&db, "bob");

        let pet = db.insert_pet(alice, &sample_pet(), at(9, 0)).unwrap();
        db.select_pet(alice, pet.id).unwrap();
        db.add_water(alice, 250, at(9, 0)).unwrap();
        db.start_sleep(alice, at(22, 0)).unwrap();
        db.end_sleep(alice, at(23, 0)).unwrap();
        db.update_progress(
            alice,
            &UpdateProgress {
                current_weight: Some(70.0),
                goal_weight: Some(65.0),
                log_entry: true,
                ..UpdateProgress::default()
            },
            at(9, 0),
        )
        .unwrap();

        db.delete_user(alice, alice.user_id()).unwrap();

        assert!(db.get_user(alice.user_id()).unwrap().is_none());
        assert_eq!(count(&db, "SELECT COUNT(*) FROM pets"), 0);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM water_intake_entries"), 0);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM sleep_entries"), 0);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM progress_entries"), 0);
        // bob's records survive
        assert_eq!(count(&db, "SELECT COUNT(*) FROM meals"), 3);
        assert!(db.water(bob).is_ok());
    }

    #[test]
    fn test_delete_other_user_forbidden() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        let bob = register(&db, "bob");

        let err = db.delete_user(alice, bob.user_id()).unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        assert!(db.user_exists(bob.user_id()).unwrap());
    }

    // --- Pets ---

    #[test]
    fn test_insert_and_list_pets() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        let bob = register(&db, "bob");

        let pet = db.insert_pet(alice, &sample_pet(), at(9, 0)).unwrap();
        assert_eq!(pet.owner_id, alice.user_id());
        assert_eq!(pet.gender, Some(Gender::Male));
        db.insert_pet(bob, &sample_pet(), at(9, 0)).unwrap();

        let mine = db.pets_for_owner(alice, alice.user_id()).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, pet.id);

        let err = db.pets_for_owner(alice, bob.user_id()).unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[test]
    fn test_pet_ownership_guard() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        let bob = register(&db, "bob");
        let pet = db.insert_pet(alice, &sample_pet(), at(9, 0)).unwrap();

        assert!(matches!(db.owned_pet(bob, pet.id), Err(Error::Forbidden(_))));
        assert!(matches!(db.owned_pet(bob, 999), Err(Error::NotFound(_))));

        let update = UpdatePet {
            name: Some("Stolen".to_string()),
            ..UpdatePet::default()
        };
        assert!(matches!(
            db.update_pet(bob, pet.id, &update),
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(db.delete_pet(bob, pet.id), Err(Error::Forbidden(_))));
        assert!(matches!(db.select_pet(bob, pet.id), Err(Error::Forbidden(_))));

        let unchanged = db.owned_pet(alice, pet.id).unwrap();
        assert_eq!(unchanged.name, "Rex");
    }

    #[test]
    fn test_update_pet_partial() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        let pet = db.insert_pet(alice, &sample_pet(), at(9, 0)).unwrap();

        let updated = db
            .update_pet(
                alice,
                pet.id,
                &UpdatePet {
                    age: Some(Some(4)),
                    breed: Some(None),
                    ..UpdatePet::default()
                },
            )
            .unwrap();
        assert_eq!(updated.age, Some(4));
        assert_eq!(updated.breed, None);
        assert_eq!(updated.name, "Rex");
        assert_eq!(updated.gender, Some(Gender::Male));
    }

    #[test]
    fn test_update_pet_rejects_blank_name_and_bad_age() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        let pet = db.insert_pet(alice, &sample_pet(), at(9, 0)).unwrap();

        let blank = UpdatePet {
            name: Some("  ".to_string()),
            ..UpdatePet::default()
        };
        assert!(matches!(
            db.update_pet(alice, pet.id, &blank),
            Err(Error::BadRequest(_))
        ));
        let old = UpdatePet {
            age: Some(Some(250)),
            ..UpdatePet::default()
        };
        assert!(matches!(
            db.update_pet(alice, pet.id, &old),
            Err(Error::BadRequest(_))
        ));
    }

    #[test]
    fn test_delete_selected_pet_clears_selection() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        let pet = db.insert_pet(alice, &sample_pet(), at(9, 0)).unwrap();

        let user = db.select_pet(alice, pet.id).unwrap();
        assert_eq!(user.selected_pet_id, Some(pet.id));

        db.delete_pet(alice, pet.id).unwrap();
        assert!(db.get_pet(pet.id).unwrap().is_none());
        let user = db.get_user(alice.user_id()).unwrap().unwrap();
        assert_eq!(user.selected_pet_id, None);
    }

    // --- Water ---

    #[test]
    fn test_water_total_tracks_sum_of_entries() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");

        let amounts = [250, 500, 125, 330, 1000];
        for (i, amount) in amounts.iter().enumerate() {
            db.add_water(alice, *amount, at(9, i as u32)).unwrap();
        }

        let water = db.water(alice).unwrap();
        let entry_sum: i64 = water.entries.iter().map(|e| e.amount).sum();
        assert_eq!(water.total_intake, amounts.iter().sum::<i64>());
        assert_eq!(water.total_intake, entry_sum);
        assert_eq!(water.entries.len(), amounts.len());
    }

    #[test]
    fn test_water_reset_clears_entries_and_total() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        let bob = register(&db, "bob");
        db.add_water(alice, 500, at(9, 0)).unwrap();
        db.add_water(bob, 300, at(9, 0)).unwrap();

        let water = db.reset_water(alice, at(23, 59)).unwrap();
        assert_eq!(water.total_intake, 0);
        assert!(water.entries.is_empty());
        assert_eq!(water.last_reset_date, Some(at(23, 59)));

        // new additions count from the reset
        let water = db.add_water(alice, 200, at(23, 59)).unwrap();
        assert_eq!(water.total_intake, 200);
        // other users untouched
        assert_eq!(db.water(bob).unwrap().total_intake, 300);
    }

    #[test]
    fn test_add_water_rejects_out_of_range_amount() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");

        assert!(matches!(db.add_water(alice, 0, at(9, 0)), Err(Error::BadRequest(_))));
        assert!(matches!(db.add_water(alice, -100, at(9, 0)), Err(Error::BadRequest(_))));
        assert_eq!(db.water(alice).unwrap().total_intake, 0);
    }

    #[test]
    fn test_set_water_goal() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        db.add_water(alice, 750, at(9, 0)).unwrap();

        let water = db.set_water_goal(alice, 3000).unwrap();
        assert_eq!(water.daily_goal, 3000);
        assert!((water.progress_pct - 25.0).abs() < f64::EPSILON);
        assert!(db.set_water_goal(alice, 0).is_err());
    }

    // --- Sleep ---

    #[test]
    fn test_end_sleep_without_start_fails() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        assert!(matches!(db.end_sleep(alice, at(7, 0)), Err(Error::NoActiveSession)));
        assert!(db.sleep(alice).unwrap().entries.is_empty());
    }

    #[test]
    fn test_sleep_session_records_duration() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");

        let record = db.start_sleep(alice, at(0, 30)).unwrap();
        assert_eq!(record.state, SleepState::Tracking);
        assert_eq!(record.current_sleep_start, Some(at(0, 30)));

        let entry = db.end_sleep(alice, at(8, 0)).unwrap();
        assert_eq!(entry.start_time, at(0, 30));
        assert_eq!(entry.end_time, at(8, 0));
        assert_eq!(entry.duration_minutes, 450);
        assert_eq!(entry.duration_seconds, 450 * 60);

        let record = db.sleep(alice).unwrap();
        assert_eq!(record.state, SleepState::Idle);
        assert_eq!(record.current_sleep_start, None);
        assert_eq!(record.entries.len(), 1);
        assert_eq!(record.entries[0].duration_minutes, 450);

        // closed session cannot be ended twice
        assert!(matches!(db.end_sleep(alice, at(9, 0)), Err(Error::NoActiveSession)));
    }

    #[test]
    fn test_start_sleep_twice_overwrites_start() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");

        db.start_sleep(alice, at(1, 0)).unwrap();
        db.start_sleep(alice, at(2, 0)).unwrap();
        let entry = db.end_sleep(alice, at(3, 0)).unwrap();
        assert_eq!(entry.start_time, at(2, 0));
        assert_eq!(db.sleep(alice).unwrap().entries.len(), 1);
    }

    #[test]
    fn test_end_sleep_before_start_clamps_to_zero() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");

        db.start_sleep(alice, at(6, 0)).unwrap();
        let entry = db.end_sleep(alice, at(6, 0) - Duration::minutes(5)).unwrap();
        assert_eq!(entry.duration_minutes, 0);
        assert_eq!(entry.duration_seconds, 0);
        assert_eq!(entry.end_time, entry.start_time);
    }

    #[test]
    fn test_short_sleep_keeps_exact_seconds() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");

        db.start_sleep(alice, at(6, 0)).unwrap();
        let entry = db.end_sleep(alice, at(6, 0) + Duration::seconds(59)).unwrap();
        assert_eq!(entry.duration_seconds, 59);
        assert_eq!(entry.duration_minutes, 0);

        let record = db.sleep(alice).unwrap();
        assert_eq!(record.entries[0].duration_seconds, 59);
    }

    #[test]
    fn test_reset_sleep_forces_idle() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");

        db.start_sleep(alice, at(0, 0)).unwrap();
        db.end_sleep(alice, at(6, 0)).unwrap();
        db.start_sleep(alice, at(22, 0)).unwrap();

        let record = db.reset_sleep(alice).unwrap();
        assert_eq!(record.state, SleepState::Idle);
        assert!(record.entries.is_empty());
    }

    // --- Nutrition ---

    #[test]
    fn test_update_meal_and_total() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        let meals = db.nutrition(alice).unwrap().meals;

        db.update_meal(
            alice,
            meals[0].id,
            &UpdateMeal {
                calories: Some(450),
                time: Some(Some(at(8, 15))),
                ..UpdateMeal::default()
            },
        )
        .unwrap();
        let record = db
            .update_meal(
                alice,
                meals[2].id,
                &UpdateMeal {
                    calories: Some(700),
                    ..UpdateMeal::default()
                },
            )
            .unwrap();

        assert_eq!(record.total_calories, 1150);
        assert_eq!(record.meals[0].time, Some(at(8, 15)));
        assert_eq!(record.meals[1].calories, 0);
    }

    #[test]
    fn test_update_meal_time_null_clears() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        let meal_id = db.nutrition(alice).unwrap().meals[1].id;

        db.update_meal(
            alice,
            meal_id,
            &UpdateMeal {
                time: Some(Some(at(13, 0))),
                calories: Some(600),
                ..UpdateMeal::default()
            },
        )
        .unwrap();
        let record = db
            .update_meal(
                alice,
                meal_id,
                &UpdateMeal {
                    time: Some(None),
                    ..UpdateMeal::default()
                },
            )
            .unwrap();
        assert_eq!(record.meals[1].time, None);
        assert_eq!(record.meals[1].calories, 600);
    }

    #[test]
    fn test_update_meal_of_other_user_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        let bob = register(&db, "bob");
        let bobs_meal = db.nutrition(bob).unwrap().meals[0].id;

        let err = db
            .update_meal(
                alice,
                bobs_meal,
                &UpdateMeal {
                    calories: Some(100),
                    ..UpdateMeal::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(db.nutrition(bob).unwrap().meals[0].calories, 0);
    }

    #[test]
    fn test_reset_nutrition_keeps_meal_identities() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        let before = db.nutrition(alice).unwrap();
        for meal in &before.meals {
            db.update_meal(
                alice,
                meal.id,
                &UpdateMeal {
                    calories: Some(300),
                    time: Some(Some(at(12, 0))),
                    ..UpdateMeal::default()
                },
            )
            .unwrap();
        }

        let after = db.reset_nutrition(alice).unwrap();
        assert_eq!(after.meals.len(), 3);
        assert_eq!(after.total_calories, 0);
        for (old, new) in before.meals.iter().zip(&after.meals) {
            assert_eq!(old.id, new.id);
            assert_eq!(old.name, new.name);
            assert_eq!(new.calories, 0);
            assert_eq!(new.time, None);
        }
    }

    #[test]
    fn test_set_calorie_goal() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        assert_eq!(db.set_calorie_goal(alice, 1800).unwrap().daily_goal, 1800);
        assert!(matches!(db.set_calorie_goal(alice, -1), Err(Error::BadRequest(_))));
    }

    // --- Progress ---

    #[test]
    fn test_progress_entry_requires_opt_in_and_positive_weights() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");

        // opt-in but goal weight still zero
        let (_, logged) = db
            .update_progress(
                alice,
                &UpdateProgress {
                    current_weight: Some(80.0),
                    log_entry: true,
                    ..UpdateProgress::default()
                },
                at(9, 0),
            )
            .unwrap();
        assert!(!logged);

        // both positive but no opt-in
        let (_, logged) = db
            .update_progress(
                alice,
                &UpdateProgress {
                    goal_weight: Some(72.0),
                    ..UpdateProgress::default()
                },
                at(9, 0),
            )
            .unwrap();
        assert!(!logged);

        let (record, logged) = db
            .update_progress(
                alice,
                &UpdateProgress {
                    log_entry: true,
                    ..UpdateProgress::default()
                },
                at(10, 0),
            )
            .unwrap();
        assert!(logged);
        assert_eq!(record.entries.len(), 1);
        assert!((record.entries[0].current_weight - 80.0).abs() < f64::EPSILON);
        assert!((record.entries[0].goal_weight - 72.0).abs() < f64::EPSILON);
        assert_eq!(record.entries[0].date, at(10, 0));
    }

    #[test]
    fn test_progress_partial_update_and_bmi() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");

        db.update_progress(
            alice,
            &UpdateProgress {
                height: Some(180.0),
                ..UpdateProgress::default()
            },
            at(9, 0),
        )
        .unwrap();
        let (record, _) = db
            .update_progress(
                alice,
                &UpdateProgress {
                    weight: Some(81.0),
                    ..UpdateProgress::default()
                },
                at(9, 0),
            )
            .unwrap();
        assert!((record.height - 180.0).abs() < f64::EPSILON);
        assert_eq!(record.bmi, Some(25.0));
    }

    #[test]
    fn test_progress_rejects_negative_values() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        let err = db
            .update_progress(
                alice,
                &UpdateProgress {
                    current_weight: Some(-3.0),
                    ..UpdateProgress::default()
                },
                at(9, 0),
            )
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn test_reset_progress_zeroes_everything() {
        let db = Database::open_in_memory().unwrap();
        let alice = register(&db, "alice");
        db.update_progress(
            alice,
            &UpdateProgress {
                current_weight: Some(80.0),
                goal_weight: Some(75.0),
                height: Some(175.0),
                weight: Some(80.0),
                log_entry: true,
            },
            at(9, 0),
        )
        .unwrap();

        let record = db.reset_progress(alice).unwrap();
        assert!(record.entries.is_empty());
        assert!(record.current_weight.abs() < f64::EPSILON);
        assert!(record.goal_weight.abs() < f64::EPSILON);
        assert!(record.height.abs() < f64::EPSILON);
        assert!(record.weight.abs() < f64::EPSILON);
        assert_eq!(record.bmi, None);
    }

    #[test]
    fn test_migration_sets_user_version() {
        let db = Database::open_in_memory().unwrap();
        let version: i64 = db
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
        // migrating again is a no-op
        db.migrate().unwrap();
    }
}
