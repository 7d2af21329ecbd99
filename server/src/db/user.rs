use super::{Result, SqlxSnafu};
use crate::problem::Problem;
use crate::types::{Submission, User};
use rand::distributions::Alphanumeric;
use rand::Rng;
use snafu::ResultExt;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    token: String,
    best_scores: String,
    best_submits: String,
    best_submit_date: String,
    total_score: f64,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            token: row.token,
            best_scores: serde_json::from_str(&row.best_scores).unwrap_or_default(),
            best_submits: serde_json::from_str(&row.best_submits).unwrap_or_default(),
            best_submit_date: serde_json::from_str(&row.best_submit_date).unwrap_or_default(),
            total_score: row.total_score,
        }
    }
}

fn new_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

pub(super) async fn fetch(con: &mut SqliteConnection, id: &str) -> Result<Option<User>> {
    let row: Option<UserRow> = sqlx::query_as("SELECT * FROM Users WHERE id = ?")
        .bind(id)
        .fetch_optional(con)
        .await
        .context(SqlxSnafu)?;
    Ok(row.map(User::from))
}

pub(super) async fn fetch_by_token(
    con: &mut SqliteConnection,
    token: &str,
) -> Result<Option<User>> {
    let row: Option<UserRow> = sqlx::query_as("SELECT * FROM Users WHERE token = ?")
        .bind(token)
        .fetch_optional(con)
        .await
        .context(SqlxSnafu)?;
    Ok(row.map(User::from))
}

pub(super) async fn save(con: &mut SqliteConnection, user: &User) -> Result<()> {
    let best_scores = serde_json::to_string(&user.best_scores).unwrap_or_else(|_| "{}".to_string());
    let best_submits =
        serde_json::to_string(&user.best_submits).unwrap_or_else(|_| "{}".to_string());
    let best_submit_date =
        serde_json::to_string(&user.best_submit_date).unwrap_or_else(|_| "{}".to_string());

    sqlx::query(
        r#"
        INSERT INTO Users
            (id, token, best_scores, best_submits, best_submit_date, total_score)
        VALUES
            (?, ?, ?, ?, ?, ?)
        ON CONFLICT (id) DO UPDATE SET
            token = excluded.token,
            best_scores = excluded.best_scores,
            best_submits = excluded.best_submits,
            best_submit_date = excluded.best_submit_date,
            total_score = excluded.total_score
        "#,
    )
    .bind(&user.id)
    .bind(&user.token)
    .bind(best_scores)
    .bind(best_submits)
    .bind(best_submit_date)
    .bind(user.total_score)
    .execute(con)
    .await
    .context(SqlxSnafu)?;

    Ok(())
}

pub(super) async fn ensure(con: &mut SqliteConnection, id: &str) -> Result<User> {
    if let Some(user) = fetch(&mut *con, id).await? {
        return Ok(user);
    }
    let user = User::new(id.to_string(), new_token());
    save(&mut *con, &user).await?;
    info!(user = id, "Created user");
    Ok(user)
}

pub(super) async fn list_by_score(con: &mut SqliteConnection) -> Result<Vec<User>> {
    let rows: Vec<UserRow> = sqlx::query_as("SELECT * FROM Users ORDER BY total_score DESC")
        .fetch_all(con)
        .await
        .context(SqlxSnafu)?;
    Ok(rows.into_iter().map(User::from).collect())
}

pub(super) async fn update_best(
    con: &mut SqliteConnection,
    sub: &Submission,
    weight: f64,
) -> Result<()> {
    let mut user = ensure(&mut *con, &sub.user).await?;
    if user.apply_submission(sub, weight) {
        info!(
            user = %user.id,
            problem = %sub.problem,
            score = user.best_scores.get(&sub.problem),
            total = user.total_score,
            "New best score"
        );
    }
    save(&mut *con, &user).await
}

/// Rebuilds every user's best-score maps from the full submissions table,
/// keeping tokens of existing rows.
pub(super) async fn rescan(
    con: &mut SqliteConnection,
    submissions: &[Submission],
    problems: &HashMap<String, Arc<Problem>>,
) -> Result<usize> {
    let mut users: HashMap<String, User> = HashMap::new();

    for sub in submissions {
        if !users.contains_key(&sub.user) {
            let existing = fetch(&mut *con, &sub.user).await?;
            let mut fresh = existing.unwrap_or_else(|| User::new(sub.user.clone(), new_token()));
            fresh.best_scores.clear();
            fresh.best_submits.clear();
            fresh.best_submit_date.clear();
            fresh.total_score = 0.0;
            users.insert(sub.user.clone(), fresh);
        }
        let user = users.get_mut(&sub.user).expect("inserted above");
        let weight = problems.get(&sub.problem).map(|p| p.weight).unwrap_or(1.0);
        user.apply_submission(sub, weight);
    }

    let count = users.len();
    for user in users.values() {
        save(&mut *con, user).await?;
    }
    info!(users = count, "Rebuilt user scores");
    Ok(count)
}
