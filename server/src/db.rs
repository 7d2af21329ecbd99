mod submission;
mod user;

use crate::problem::Problem;
use crate::types::{Submission, User};
use snafu::{Location, ResultExt, Snafu};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Snafu)]
pub enum DbError {
    #[snafu(display("Could not open database `{}`", path.display()))]
    Open {
        path: PathBuf,
        source: sqlx::Error,
    },
    #[snafu(display("Could not run database migrations"))]
    Migrate {
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("Database error at {location}"))]
    Sqlx {
        source: sqlx::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Durable storage for submission rows and user best-score rows. Writers are
/// serialized through the lock; composite fields round-trip through JSON
/// text columns, the user-face buffer through a blob.
#[derive(Clone)]
pub struct Database {
    lock: Arc<RwLock<Pool<Sqlite>>>,
}

impl Database {
    pub async fn new(db_path: &Path) -> Result<Self> {
        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::default()
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .filename(db_path),
        )
        .await
        .context(OpenSnafu { path: db_path })?;

        sqlx::migrate!().run(&pool).await.context(MigrateSnafu)?;

        Ok(Self {
            lock: Arc::new(RwLock::new(pool)),
        })
    }

    async fn write_lock(&self) -> RwLockWriteGuard<'_, Pool<Sqlite>> {
        self.lock.write().await
    }

    async fn read_lock(&self) -> RwLockReadGuard<'_, Pool<Sqlite>> {
        self.lock.read().await
    }

    /// Crash recovery: every row a previous process left in a non-terminal
    /// state becomes `dead`. Returns how many rows were affected.
    pub async fn mark_dead_submissions(&self) -> Result<u64> {
        let pool = self.write_lock().await;
        submission::mark_dead(&mut *pool.acquire().await.context(SqlxSnafu)?).await
    }

    pub async fn save_submission(&self, sub: &Submission) -> Result<()> {
        let pool = self.write_lock().await;
        submission::save(&mut *pool.acquire().await.context(SqlxSnafu)?, sub).await
    }

    pub async fn get_submission(&self, id: &str) -> Result<Option<Submission>> {
        let pool = self.read_lock().await;
        submission::fetch(&mut *pool.acquire().await.context(SqlxSnafu)?, id).await
    }

    /// Newest first, 1-based page.
    pub async fn list_submissions(&self, page: i64, limit: i64) -> Result<Vec<Submission>> {
        let pool = self.read_lock().await;
        submission::list(&mut *pool.acquire().await.context(SqlxSnafu)?, page, limit).await
    }

    pub async fn count_submissions(&self) -> Result<i64> {
        let pool = self.read_lock().await;
        submission::count(&mut *pool.acquire().await.context(SqlxSnafu)?).await
    }

    pub async fn list_user_submissions(&self, user: &str) -> Result<Vec<Submission>> {
        let pool = self.read_lock().await;
        submission::list_for_user(&mut *pool.acquire().await.context(SqlxSnafu)?, user).await
    }

    /// Submissions of `user` whose id contains `fragment`, newest first.
    pub async fn find_user_submissions(
        &self,
        user: &str,
        fragment: &str,
    ) -> Result<Vec<Submission>> {
        let pool = self.read_lock().await;
        submission::find_for_user(
            &mut *pool.acquire().await.context(SqlxSnafu)?,
            user,
            fragment,
        )
        .await
    }

    pub async fn fetch_user(&self, id: &str) -> Result<Option<User>> {
        let pool = self.read_lock().await;
        user::fetch(&mut *pool.acquire().await.context(SqlxSnafu)?, id).await
    }

    pub async fn fetch_user_by_token(&self, token: &str) -> Result<Option<User>> {
        let pool = self.read_lock().await;
        user::fetch_by_token(&mut *pool.acquire().await.context(SqlxSnafu)?, token).await
    }

    /// Fetches the user row, creating it with a fresh access token on first
    /// contact.
    pub async fn ensure_user(&self, id: &str) -> Result<User> {
        let pool = self.write_lock().await;
        user::ensure(&mut *pool.acquire().await.context(SqlxSnafu)?, id).await
    }

    /// Users ordered by total score, best first.
    pub async fn list_users(&self) -> Result<Vec<User>> {
        let pool = self.read_lock().await;
        user::list_by_score(&mut *pool.acquire().await.context(SqlxSnafu)?).await
    }

    /// Folds a terminated submission into the submitting user's best-score
    /// row, creating the row on first submission.
    pub async fn update_user_best(&self, sub: &Submission, weight: f64) -> Result<()> {
        let pool = self.write_lock().await;
        user::update_best(&mut *pool.acquire().await.context(SqlxSnafu)?, sub, weight).await
    }

    /// Full rebuild of every user's best-score row from the submissions
    /// table. Existing tokens are preserved. Returns the user count.
    pub async fn rescan_users(
        &self,
        problems: &HashMap<String, Arc<Problem>>,
    ) -> Result<usize> {
        let pool = self.write_lock().await;
        let mut con = pool.acquire().await.context(SqlxSnafu)?;
        let submissions = submission::fetch_all(&mut con).await?;
        user::rescan(&mut con, &submissions, problems).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Status, Submission, SubmittedFile};

    async fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&dir.path().join("soj.db")).await.unwrap();
        (dir, db)
    }

    fn submission(id: &str, user: &str, status: Status) -> Submission {
        let mut sub = Submission::new(id.to_string(), user.to_string(), "p1".to_string());
        sub.status = status;
        sub
    }

    #[tokio::test]
    async fn submission_rows_round_trip() {
        let (_dir, db) = open().await;

        let mut sub = submission("100", "u1", Status::Completed);
        sub.msg = "judge successfully finished".to_string();
        sub.files.push(SubmittedFile {
            path: "hello.txt".to_string(),
            hash: "31d30eea8d0968d6458e0ad0027c9f80".to_string(),
        });
        sub.judge_result.success = true;
        sub.judge_result.score = 100.0;
        sub.user_face.writeln("X");
        sub.user_face.writeln("Y");
        db.save_submission(&sub).await.unwrap();

        let loaded = db.get_submission("100").await.unwrap().unwrap();
        assert_eq!(loaded.status, Status::Completed);
        assert_eq!(loaded.msg, "judge successfully finished");
        assert_eq!(loaded.files, sub.files);
        assert_eq!(loaded.judge_result.score, 100.0);
        assert_eq!(loaded.user_face.contents(), b"X\nY\n");
        assert!(loaded.submit_time <= loaded.last_update);
    }

    #[tokio::test]
    async fn saving_twice_updates_in_place() {
        let (_dir, db) = open().await;

        let mut sub = submission("100", "u1", Status::Init);
        db.save_submission(&sub).await.unwrap();
        sub.set_status(Status::PrepDirs);
        db.save_submission(&sub).await.unwrap();

        assert_eq!(db.count_submissions().await.unwrap(), 1);
        let loaded = db.get_submission("100").await.unwrap().unwrap();
        assert_eq!(loaded.status, Status::PrepDirs);
    }

    #[tokio::test]
    async fn startup_scan_kills_only_non_terminal_rows() {
        let (_dir, db) = open().await;

        db.save_submission(&submission("1", "u1", Status::Completed))
            .await
            .unwrap();
        db.save_submission(&submission(
            "2",
            "u1",
            Status::WorkflowStep {
                workflow: 0,
                step: 1,
            },
        ))
        .await
        .unwrap();
        db.save_submission(&submission("3", "u2", Status::Failed))
            .await
            .unwrap();

        assert_eq!(db.mark_dead_submissions().await.unwrap(), 1);
        assert_eq!(
            db.get_submission("2").await.unwrap().unwrap().status,
            Status::Dead
        );
        assert_eq!(
            db.get_submission("1").await.unwrap().unwrap().status,
            Status::Completed
        );
    }

    #[tokio::test]
    async fn best_scores_accumulate_per_user() {
        let (_dir, db) = open().await;

        let mut first = submission("1", "u1", Status::Completed);
        first.judge_result.score = 40.0;
        db.update_user_best(&first, 1.0).await.unwrap();

        let mut worse = submission("2", "u1", Status::Completed);
        worse.judge_result.score = 10.0;
        db.update_user_best(&worse, 1.0).await.unwrap();

        let user = db.fetch_user("u1").await.unwrap().unwrap();
        assert_eq!(user.best_scores["p1"], 40.0);
        assert_eq!(user.best_submits["p1"], "1");
        assert_eq!(user.total_score, 40.0);
        assert!(!user.token.is_empty());

        // Token lookup matches the stored row.
        let by_token = db.fetch_user_by_token(&user.token).await.unwrap().unwrap();
        assert_eq!(by_token.id, "u1");
    }

    #[tokio::test]
    async fn substring_lookup_is_scoped_to_the_user() {
        let (_dir, db) = open().await;
        db.save_submission(&submission("17354001", "u1", Status::Completed))
            .await
            .unwrap();
        db.save_submission(&submission("17354002", "u2", Status::Completed))
            .await
            .unwrap();

        let hits = db.find_user_submissions("u1", "5400").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "17354001");

        let misses = db.find_user_submissions("u1", "9999").await.unwrap();
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn rescan_rebuilds_users_and_keeps_tokens() {
        let (_dir, db) = open().await;

        let mut sub = submission("1", "u1", Status::Completed);
        sub.judge_result.score = 50.0;
        db.save_submission(&sub).await.unwrap();
        db.update_user_best(&sub, 1.0).await.unwrap();
        let token = db.fetch_user("u1").await.unwrap().unwrap().token;

        let rebuilt = db.rescan_users(&HashMap::new()).await.unwrap();
        assert_eq!(rebuilt, 1);
        let user = db.fetch_user("u1").await.unwrap().unwrap();
        assert_eq!(user.token, token);
        assert_eq!(user.best_scores["p1"], 50.0);
        assert_eq!(user.total_score, 50.0);
    }

    #[tokio::test]
    async fn pagination_is_newest_first() {
        let (_dir, db) = open().await;
        for i in 0..5 {
            let mut sub = submission(&format!("{i}"), "u1", Status::Completed);
            sub.submit_time = i;
            db.save_submission(&sub).await.unwrap();
        }

        let page = db.list_submissions(1, 2).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["4", "3"]);

        let page = db.list_submissions(2, 2).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["2", "1"]);
    }
}
