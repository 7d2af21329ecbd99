use super::{Result, SqlxSnafu};
use crate::types::{now_ns, Status, Submission};
use crate::userface::UserFace;
use snafu::ResultExt;
use sqlx::SqliteConnection;

/// Raw table row. Composite fields live in JSON text columns; the converter
/// back into the domain type treats anything unexpected as empty.
#[derive(sqlx::FromRow)]
struct SubmissionRow {
    id: String,
    user: String,
    problem: String,
    submit_time: i64,
    last_update: i64,
    status: String,
    msg: String,
    submits_dir: String,
    workdir: String,
    files: String,
    workflow_results: String,
    judge_result: String,
    user_face: Vec<u8>,
}

impl From<SubmissionRow> for Submission {
    fn from(row: SubmissionRow) -> Self {
        Self {
            id: row.id,
            user: row.user,
            problem: row.problem,
            submit_time: row.submit_time,
            last_update: row.last_update,
            status: row.status.parse().unwrap_or(Status::Dead),
            msg: row.msg,
            submits_dir: row.submits_dir,
            workdir: row.workdir,
            files: serde_json::from_str(&row.files).unwrap_or_default(),
            workflow_results: serde_json::from_str(&row.workflow_results).unwrap_or_default(),
            judge_result: serde_json::from_str(&row.judge_result).unwrap_or_default(),
            user_face: UserFace::from_bytes(row.user_face),
        }
    }
}

pub(super) async fn save(con: &mut SqliteConnection, sub: &Submission) -> Result<()> {
    let files = serde_json::to_string(&sub.files).unwrap_or_else(|_| "[]".to_string());
    let workflow_results =
        serde_json::to_string(&sub.workflow_results).unwrap_or_else(|_| "[]".to_string());
    let judge_result =
        serde_json::to_string(&sub.judge_result).unwrap_or_else(|_| "{}".to_string());
    let user_face = sub.user_face.contents();

    sqlx::query(
        r#"
        INSERT INTO Submissions
            (id, user, problem, submit_time, last_update, status, msg,
             submits_dir, workdir, files, workflow_results, judge_result, user_face)
        VALUES
            (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (id) DO UPDATE SET
            last_update = excluded.last_update,
            status = excluded.status,
            msg = excluded.msg,
            submits_dir = excluded.submits_dir,
            workdir = excluded.workdir,
            files = excluded.files,
            workflow_results = excluded.workflow_results,
            judge_result = excluded.judge_result,
            user_face = excluded.user_face
        "#,
    )
    .bind(&sub.id)
    .bind(&sub.user)
    .bind(&sub.problem)
    .bind(sub.submit_time)
    .bind(sub.last_update)
    .bind(sub.status.to_string())
    .bind(&sub.msg)
    .bind(&sub.submits_dir)
    .bind(&sub.workdir)
    .bind(files)
    .bind(workflow_results)
    .bind(judge_result)
    .bind(user_face)
    .execute(con)
    .await
    .context(SqlxSnafu)?;

    Ok(())
}

pub(super) async fn fetch(con: &mut SqliteConnection, id: &str) -> Result<Option<Submission>> {
    let row: Option<SubmissionRow> = sqlx::query_as("SELECT * FROM Submissions WHERE id = ?")
        .bind(id)
        .fetch_optional(con)
        .await
        .context(SqlxSnafu)?;
    Ok(row.map(Submission::from))
}

pub(super) async fn list(
    con: &mut SqliteConnection,
    page: i64,
    limit: i64,
) -> Result<Vec<Submission>> {
    let rows: Vec<SubmissionRow> = sqlx::query_as(
        "SELECT * FROM Submissions ORDER BY submit_time DESC LIMIT ? OFFSET ?",
    )
    .bind(limit)
    .bind((page - 1) * limit)
    .fetch_all(con)
    .await
    .context(SqlxSnafu)?;
    Ok(rows.into_iter().map(Submission::from).collect())
}

pub(super) async fn count(con: &mut SqliteConnection) -> Result<i64> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM Submissions")
        .fetch_one(con)
        .await
        .context(SqlxSnafu)?;
    Ok(count.0)
}

pub(super) async fn list_for_user(
    con: &mut SqliteConnection,
    user: &str,
) -> Result<Vec<Submission>> {
    let rows: Vec<SubmissionRow> =
        sqlx::query_as("SELECT * FROM Submissions WHERE user = ? ORDER BY submit_time DESC")
            .bind(user)
            .fetch_all(con)
            .await
            .context(SqlxSnafu)?;
    Ok(rows.into_iter().map(Submission::from).collect())
}

pub(super) async fn find_for_user(
    con: &mut SqliteConnection,
    user: &str,
    fragment: &str,
) -> Result<Vec<Submission>> {
    let rows: Vec<SubmissionRow> = sqlx::query_as(
        r#"
        SELECT * FROM Submissions
        WHERE user = ? AND instr(id, ?) > 0
        ORDER BY submit_time DESC
        "#,
    )
    .bind(user)
    .bind(fragment)
    .fetch_all(con)
    .await
    .context(SqlxSnafu)?;
    Ok(rows.into_iter().map(Submission::from).collect())
}

pub(super) async fn fetch_all(con: &mut SqliteConnection) -> Result<Vec<Submission>> {
    let rows: Vec<SubmissionRow> =
        sqlx::query_as("SELECT * FROM Submissions ORDER BY submit_time ASC")
            .fetch_all(con)
            .await
            .context(SqlxSnafu)?;
    Ok(rows.into_iter().map(Submission::from).collect())
}

pub(super) async fn mark_dead(con: &mut SqliteConnection) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE Submissions SET status = 'dead', last_update = ? \
         WHERE status NOT IN ('completed', 'failed', 'dead')",
    )
    .bind(now_ns())
    .execute(con)
    .await
    .context(SqlxSnafu)?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::SqlitePool;

    /// Columns holding something that is neither valid JSON nor the expected
    /// shape decode as empty, they never fail the read.
    #[tokio::test]
    async fn unexpected_column_values_decode_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::default()
                .create_if_missing(true)
                .filename(dir.path().join("soj.db")),
        )
        .await
        .unwrap();
        sqlx::migrate!().run(&pool).await.unwrap();

        sqlx::query(
            r#"
            INSERT INTO Submissions
                (id, user, problem, submit_time, last_update, status, msg,
                 submits_dir, workdir, files, workflow_results, judge_result, user_face)
            VALUES
                ('1', 'u1', 'p1', 0, 0, 'no_such_state', '', '', '',
                 'not json at all', '17', 'true', X'58')
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let mut con = pool.acquire().await.unwrap();
        let sub = fetch(&mut con, "1").await.unwrap().unwrap();
        assert_eq!(sub.status, Status::Dead);
        assert!(sub.files.is_empty());
        assert!(sub.workflow_results.is_empty());
        assert!(!sub.judge_result.success);
        assert_eq!(sub.user_face.contents(), b"X");
    }
}
