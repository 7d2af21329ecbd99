use jiff::Timestamp;
use std::sync::atomic::Ordering;
use tracing::error;

use super::Term;
use crate::judge;
use crate::types::{AppState, Status, Submission};
use crate::userface::{ANSI_GREEN, ANSI_RESET, ANSI_YELLOW};

const LIST_PAGE_SIZE: i64 = 10;
const REDACTED_USER: &str = "Anonymous";

pub enum Outcome {
    Continue,
    Exit,
}

/// Parses and runs one command line. All output goes through the terminal;
/// misuse yields a usage line, never an error up the stack.
pub async fn dispatch(state: &AppState, user: &str, line: &str, term: &mut Term) -> Outcome {
    let argv: Vec<&str> = line.split_whitespace().collect();
    let Some((&command, args)) = argv.split_first() else {
        return Outcome::Continue;
    };

    match command {
        "help" => help(state, term).await,
        "exit" | "quit" | "logout" => return Outcome::Exit,
        "submit" | "sub" => submit(state, user, args, term).await,
        "list" | "ls" => list(state, user, args, term).await,
        "status" | "st" => status(state, user, args, term).await,
        "rank" | "rk" => rank(state, term).await,
        "my" => my(state, user, term).await,
        "token" => token(state, user, term).await,
        "adm" => adm(state, user, args, term).await,
        other => {
            term.write(&format!("unknown command `{other}`, try `help`\n"))
                .await;
        }
    }
    Outcome::Continue
}

async fn help(state: &AppState, term: &mut Term) {
    term.write(concat!(
        "commands:\n",
        "  submit|sub <problem>   judge your uploaded files\n",
        "  list|ls [page]         recent submissions\n",
        "  status|st <id-part>    details of one of your submissions\n",
        "  rank|rk                scoreboard\n",
        "  my                     your best scores\n",
        "  token                  your API access token\n",
        "  exit                   leave\n",
        "upload files with sftp into your inbox first\n",
    ))
    .await;

    let ids = state.problems.ids();
    if ids.is_empty() {
        return;
    }
    term.write("problems:\n").await;
    for id in ids {
        let line = if state.config.problem_url_prefix.is_empty() {
            format!("  {id}\n")
        } else {
            format!("  {id}  {}{id}\n", state.config.problem_url_prefix)
        };
        term.write(&line).await;
    }
}

async fn submit(state: &AppState, user: &str, args: &[&str], term: &mut Term) {
    let [problem] = args else {
        term.write("usage: submit <problem-id>\n").await;
        return;
    };

    let handle = match judge::submit(state, user, problem).await {
        Ok(handle) => handle,
        Err(e) => {
            term.write(&format!("{e}\n")).await;
            return;
        }
    };

    term.write(&format!(
        "{ANSI_YELLOW}judging submission {}{ANSI_RESET}\n",
        handle.id
    ))
    .await;

    let (history, mut live) = handle.face.attach();
    term.write_bytes(&history).await;

    let mut done = handle.done;
    loop {
        tokio::select! {
            chunk = live.recv() => {
                match chunk {
                    Some(chunk) => term.write_bytes(&chunk).await,
                    None => break,
                }
            }
            _ = &mut done => {
                // Flush whatever the judgement wrote before it finished.
                while let Ok(chunk) = live.try_recv() {
                    term.write_bytes(&chunk).await;
                }
                break;
            }
        }
    }
}

async fn list(state: &AppState, user: &str, args: &[&str], term: &mut Term) {
    let page = match args {
        [] => 1,
        [page] => match page.parse::<i64>() {
            Ok(page) if page > 0 => page,
            _ => {
                term.write("usage: list [page]\n").await;
                return;
            }
        },
        _ => {
            term.write("usage: list [page]\n").await;
            return;
        }
    };

    let admin = state.config.is_admin(user);
    let (total, submissions) = match (
        state.db.count_submissions().await,
        state.db.list_submissions(page, LIST_PAGE_SIZE).await,
    ) {
        (Ok(total), Ok(submissions)) => (total, submissions),
        (total, submissions) => {
            error!(?total, ?submissions, "Could not list submissions");
            term.write("could not list submissions\n").await;
            return;
        }
    };

    let rows: Vec<Vec<String>> = submissions
        .iter()
        .map(|sub| {
            let owner = if admin || sub.user == user {
                sub.user.clone()
            } else {
                REDACTED_USER.to_string()
            };
            vec![
                sub.id.clone(),
                owner,
                sub.problem.clone(),
                sub.status.to_string(),
                score_cell(sub),
                format_time(sub.submit_time),
            ]
        })
        .collect();

    term.write(&render_table(
        &["ID", "USER", "PROBLEM", "STATUS", "SCORE", "SUBMITTED"],
        &rows,
    ))
    .await;
    let pages = (total + LIST_PAGE_SIZE - 1) / LIST_PAGE_SIZE;
    term.write(&format!("page {page}/{} ({total} total)\n", pages.max(1)))
        .await;
}

async fn status(state: &AppState, user: &str, args: &[&str], term: &mut Term) {
    let [fragment] = args else {
        term.write("usage: status <id-substring>\n").await;
        return;
    };

    let matches = match state.db.find_user_submissions(user, fragment).await {
        Ok(matches) => matches,
        Err(e) => {
            error!(error = %e, "Could not look up submissions");
            term.write("could not look up submissions\n").await;
            return;
        }
    };

    let Some(sub) = matches.first() else {
        term.write(&format!("no submission of yours matches `{fragment}`\n"))
            .await;
        return;
    };
    if matches.len() > 1 {
        term.write(&format!(
            "{} submissions match, showing the newest\n",
            matches.len()
        ))
        .await;
    }
    show_submission(sub, term).await;
}

async fn show_submission(sub: &Submission, term: &mut Term) {
    term.write(&format!(
        concat!(
            "id:        {}\n",
            "problem:   {}\n",
            "status:    {}\n",
            "msg:       {}\n",
            "submitted: {}\n",
            "updated:   {}\n",
        ),
        sub.id,
        sub.problem,
        sub.status,
        sub.msg,
        format_time(sub.submit_time),
        format_time(sub.last_update),
    ))
    .await;

    if sub.status == Status::Completed {
        term.write(&format!(
            "score:     {}\nverdict:   {}\n",
            sub.judge_result.score, sub.judge_result.msg
        ))
        .await;
    }

    if !sub.files.is_empty() {
        term.write("files:\n").await;
        for file in &sub.files {
            term.write(&format!("  {}  md5:{}\n", file.path, file.hash))
                .await;
        }
    }

    let face = sub.user_face.contents();
    if !face.is_empty() {
        term.write("--- session replay ---\n").await;
        term.write_bytes(&face).await;
        term.write("--- end of replay ---\n").await;
    }
}

async fn rank(state: &AppState, term: &mut Term) {
    let users = match state.db.list_users().await {
        Ok(users) => users,
        Err(e) => {
            error!(error = %e, "Could not list users");
            term.write("could not list users\n").await;
            return;
        }
    };

    let rows: Vec<Vec<String>> = users
        .iter()
        .enumerate()
        .map(|(place, user)| {
            vec![
                format!("{}", place + 1),
                user.id.clone(),
                format!("{:.1}", user.total_score),
            ]
        })
        .collect();
    term.write(&render_table(&["#", "USER", "SCORE"], &rows)).await;
}

async fn my(state: &AppState, user: &str, term: &mut Term) {
    let record = match state.db.fetch_user(user).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            term.write("no submissions yet\n").await;
            return;
        }
        Err(e) => {
            error!(error = %e, "Could not load user");
            term.write("could not load your record\n").await;
            return;
        }
    };

    let mut problems: Vec<&String> = record.best_scores.keys().collect();
    problems.sort();
    let rows: Vec<Vec<String>> = problems
        .iter()
        .map(|problem| {
            vec![
                (*problem).clone(),
                format!("{:.1}", record.best_scores[*problem]),
                record
                    .best_submits
                    .get(*problem)
                    .cloned()
                    .unwrap_or_default(),
                record
                    .best_submit_date
                    .get(*problem)
                    .map(|ns| format_time(*ns))
                    .unwrap_or_default(),
            ]
        })
        .collect();
    term.write(&render_table(&["PROBLEM", "BEST", "SUBMISSION", "WHEN"], &rows))
        .await;
    term.write(&format!(
        "{ANSI_GREEN}total: {:.1}{ANSI_RESET}\n",
        record.total_score
    ))
    .await;
}

async fn token(state: &AppState, user: &str, term: &mut Term) {
    match state.db.ensure_user(user).await {
        Ok(record) => {
            term.write(&format!(
                "token: {}\npass it as the `token` cookie to the HTTP API\n",
                record.token
            ))
            .await;
        }
        Err(e) => {
            error!(error = %e, "Could not load user token");
            term.write("could not load your token\n").await;
        }
    }
}

async fn adm(state: &AppState, user: &str, args: &[&str], term: &mut Term) {
    if !state.config.is_admin(user) {
        term.write("permission denied\n").await;
        return;
    }

    match args {
        ["list"] => {
            let submissions = match state.db.list_submissions(1, 20).await {
                Ok(submissions) => submissions,
                Err(e) => {
                    error!(error = %e, "Could not list submissions");
                    term.write("could not list submissions\n").await;
                    return;
                }
            };
            let rows: Vec<Vec<String>> = submissions
                .iter()
                .map(|sub| {
                    vec![
                        sub.id.clone(),
                        sub.user.clone(),
                        sub.problem.clone(),
                        sub.status.to_string(),
                        sub.msg.clone(),
                    ]
                })
                .collect();
            term.write(&render_table(&["ID", "USER", "PROBLEM", "STATUS", "MSG"], &rows))
                .await;
        }
        ["status", id] => match state.db.get_submission(id).await {
            Ok(Some(sub)) => show_submission(&sub, term).await,
            Ok(None) => term.write(&format!("no submission with id `{id}`\n")).await,
            Err(e) => {
                error!(error = %e, "Could not load submission");
                term.write("could not load submission\n").await;
            }
        },
        ["pause"] => {
            state.paused.store(true, Ordering::Relaxed);
            term.write("submissions paused\n").await;
        }
        ["resume"] => {
            state.paused.store(false, Ordering::Relaxed);
            term.write("submissions resumed\n").await;
        }
        ["reload"] => match state.problems.reload() {
            Ok(count) => term.write(&format!("reloaded {count} problems\n")).await,
            Err(e) => {
                error!(error = %e, "Problem reload failed");
                term.write(&format!("reload failed: {e}\n")).await;
            }
        },
        ["rescan"] => match state.db.rescan_users(&state.problems.snapshot()).await {
            Ok(count) => term.write(&format!("rebuilt {count} user rows\n")).await,
            Err(e) => {
                error!(error = %e, "User rescan failed");
                term.write("rescan failed\n").await;
            }
        },
        _ => {
            term.write("usage: adm list|status <id>|pause|resume|reload|rescan\n")
                .await;
        }
    }
}

fn score_cell(sub: &Submission) -> String {
    match sub.status {
        Status::Completed => format!("{:.1}", sub.judge_result.score),
        _ => "-".to_string(),
    }
}

fn format_time(ns: i64) -> String {
    Timestamp::from_nanosecond(ns as i128)
        .unwrap_or(Timestamp::UNIX_EPOCH)
        .strftime("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Plain fixed-width table, headers underlined with dashes.
fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut out = String::new();
    for (i, header) in headers.iter().enumerate() {
        out.push_str(&format!("{:<width$}  ", header, width = widths[i]));
    }
    out.push('\n');
    for (i, _) in headers.iter().enumerate() {
        out.push_str(&"-".repeat(widths[i]));
        out.push_str("  ");
    }
    out.push('\n');
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                out.push_str(&format!("{:<width$}  ", cell, width = widths[i]));
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_align_columns() {
        let table = render_table(
            &["ID", "USER"],
            &[
                vec!["1".to_string(), "alice".to_string()],
                vec!["1234567".to_string(), "bob".to_string()],
            ],
        );
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "ID       USER   ");
        assert_eq!(lines[1], "-------  -----  ");
        assert_eq!(lines[2], "1        alice  ");
        assert_eq!(lines[3], "1234567  bob    ");
    }

    #[test]
    fn timestamps_render_readably() {
        // 2024-01-01T00:00:00Z in nanoseconds
        assert_eq!(format_time(1_704_067_200_000_000_000), "2024-01-01 00:00:00");
        assert_eq!(format_time(0), "1970-01-01 00:00:00");
    }
}
