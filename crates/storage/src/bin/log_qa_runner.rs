use std::env;
use std::process::ExitCode;

use snafu::{ResultExt, Snafu};

use banter_storage::{
    EntryLog, EntryPatch, LogEvent, NewEntry, Sender, SettingsRecord, SettingsStore, SqliteLog,
    StorageError,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    SchemaInit,
    EntryRoundtrip,
    EntryUpdate,
    UpdateMissing,
    ClearAtomicity,
    SettingsRoundtrip,
    SettingsSurviveRejoin,
    ChangeFeed,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "schema_init" => Some(Self::SchemaInit),
            "entry_roundtrip" => Some(Self::EntryRoundtrip),
            "entry_update" => Some(Self::EntryUpdate),
            "update_missing" => Some(Self::UpdateMissing),
            "clear_atomicity" => Some(Self::ClearAtomicity),
            "settings_roundtrip" => Some(Self::SettingsRoundtrip),
            "settings_survive_rejoin" => Some(Self::SettingsSurviveRejoin),
            "change_feed" => Some(Self::ChangeFeed),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::SchemaInit => "schema_init",
            Self::EntryRoundtrip => "entry_roundtrip",
            Self::EntryUpdate => "entry_update",
            Self::UpdateMissing => "update_missing",
            Self::ClearAtomicity => "clear_atomicity",
            Self::SettingsRoundtrip => "settings_roundtrip",
            Self::SettingsSurviveRejoin => "settings_survive_rejoin",
            Self::ChangeFeed => "change_feed",
            Self::All => "all",
        }
    }

    fn all() -> [Self; 8] {
        [
            Self::SchemaInit,
            Self::EntryRoundtrip,
            Self::EntryUpdate,
            Self::UpdateMissing,
            Self::ClearAtomicity,
            Self::SettingsRoundtrip,
            Self::SettingsSurviveRejoin,
            Self::ChangeFeed,
        ]
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("storage validation failed: {source}"))]
    StorageValidation {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

fn parse_args() -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut args = env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--scenario" => {
                let raw = args.next().ok_or(RunnerError::MissingArgumentValue {
                    stage: "parse-args-scenario",
                    arg: "--scenario",
                })?;
                scenario = Some(Scenario::parse(&raw).ok_or(RunnerError::UnknownScenario {
                    stage: "parse-args-scenario-value",
                    raw,
                })?);
            }
            "--db" => {
                db_path = Some(args.next().ok_or(RunnerError::MissingArgumentValue {
                    stage: "parse-args-db",
                    arg: "--db",
                })?);
            }
            other => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: other.to_string(),
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.ok_or(RunnerError::MissingScenario {
            stage: "parse-args-require-scenario",
        })?,
        db_path,
    })
}

fn database_location(args: &RunnerArgs) -> String {
    args.db_path
        .clone()
        .unwrap_or_else(|| ":memory:".to_string())
}

async fn open_log(args: &RunnerArgs, stage: &'static str) -> RunnerResult<SqliteLog> {
    SqliteLog::open(&database_location(args))
        .await
        .context(StorageValidationSnafu { stage })
}

fn user_draft(text: &str) -> NewEntry {
    NewEntry::new(Sender::User, "qa-user", text, 1_700_000_000_000)
}

fn fail(scenario: Scenario, stage: &'static str, reason: impl Into<String>) -> RunnerError {
    RunnerError::ScenarioFailed {
        stage,
        scenario: scenario.name(),
        reason: reason.into(),
    }
}

async fn run_schema_init(args: &RunnerArgs) -> RunnerResult<()> {
    let log = open_log(args, "schema-init-open").await?;
    let entries = log.list().await.context(StorageValidationSnafu {
        stage: "schema-init-list",
    })?;
    if !entries.is_empty() && args.db_path.is_none() {
        return Err(fail(
            Scenario::SchemaInit,
            "schema-init-empty",
            format!("fresh database reported {} entries", entries.len()),
        ));
    }
    Ok(())
}

async fn run_entry_roundtrip(args: &RunnerArgs) -> RunnerResult<()> {
    let log = open_log(args, "entry-roundtrip-open").await?;
    let baseline = log.list().await.context(StorageValidationSnafu {
        stage: "entry-roundtrip-baseline",
    })?;

    let first = log
        .append(user_draft("first line"))
        .await
        .context(StorageValidationSnafu {
            stage: "entry-roundtrip-append-first",
        })?;
    let second = log
        .append(user_draft("second line"))
        .await
        .context(StorageValidationSnafu {
            stage: "entry-roundtrip-append-second",
        })?;

    if second.seq <= first.seq {
        return Err(fail(
            Scenario::EntryRoundtrip,
            "entry-roundtrip-seq",
            format!("seq did not advance: {} then {}", first.seq, second.seq),
        ));
    }

    let entries = log.list().await.context(StorageValidationSnafu {
        stage: "entry-roundtrip-list",
    })?;
    let appended = &entries[baseline.len()..];
    if appended.len() != 2 || appended[0] != first || appended[1] != second {
        return Err(fail(
            Scenario::EntryRoundtrip,
            "entry-roundtrip-order",
            "list() did not return appended entries in creation order",
        ));
    }
    Ok(())
}

async fn run_entry_update(args: &RunnerArgs) -> RunnerResult<()> {
    let log = open_log(args, "entry-update-open").await?;
    let record = log
        .append(user_draft("draft").streaming())
        .await
        .context(StorageValidationSnafu {
            stage: "entry-update-append",
        })?;

    let patched = log
        .update(record.id, EntryPatch::text("draft, extended"))
        .await
        .context(StorageValidationSnafu {
            stage: "entry-update-patch-text",
        })?;
    if patched.text != "draft, extended" || !patched.is_streaming {
        return Err(fail(
            Scenario::EntryUpdate,
            "entry-update-text",
            "text patch must not disturb the streaming flag",
        ));
    }

    let closed = log
        .update(record.id, EntryPatch::stream_closed())
        .await
        .context(StorageValidationSnafu {
            stage: "entry-update-close",
        })?;
    if closed.is_streaming || closed.text != "draft, extended" {
        return Err(fail(
            Scenario::EntryUpdate,
            "entry-update-close",
            "closing the stream must keep the accumulated text",
        ));
    }
    Ok(())
}

async fn run_update_missing(args: &RunnerArgs) -> RunnerResult<()> {
    let log = open_log(args, "update-missing-open").await?;
    let outcome = log
        .update(
            banter_storage::EntryId::new_v7(),
            EntryPatch::text("nobody home"),
        )
        .await;

    match outcome {
        Err(StorageError::NotFound { .. }) => Ok(()),
        Err(other) => Err(fail(
            Scenario::UpdateMissing,
            "update-missing-error-kind",
            format!("expected NotFound, got: {other}"),
        )),
        Ok(_) => Err(fail(
            Scenario::UpdateMissing,
            "update-missing-accepted",
            "update of an unknown id must not succeed",
        )),
    }
}

async fn run_clear_atomicity(args: &RunnerArgs) -> RunnerResult<()> {
    let log = open_log(args, "clear-open").await?;
    for index in 0..4 {
        log.append(user_draft(&format!("doomed {index}")))
            .await
            .context(StorageValidationSnafu {
                stage: "clear-seed",
            })?;
    }

    log.clear().await.context(StorageValidationSnafu {
        stage: "clear-apply",
    })?;

    let entries = log.list().await.context(StorageValidationSnafu {
        stage: "clear-verify",
    })?;
    if !entries.is_empty() {
        return Err(fail(
            Scenario::ClearAtomicity,
            "clear-residue",
            format!("{} entries survived clear()", entries.len()),
        ));
    }
    Ok(())
}

async fn run_settings_roundtrip(args: &RunnerArgs) -> RunnerResult<()> {
    let log = open_log(args, "settings-open").await?;
    let record = SettingsRecord {
        username: "qa-user".to_string(),
        theme: "emerald".to_string(),
        api_credential: "qa-credential".to_string(),
        behavior_instruction: "answer tersely".to_string(),
    };

    log.save(record.clone())
        .await
        .context(StorageValidationSnafu {
            stage: "settings-save",
        })?;
    let loaded = log
        .load("qa-user")
        .await
        .context(StorageValidationSnafu {
            stage: "settings-load",
        })?;
    if loaded.as_ref() != Some(&record) {
        return Err(fail(
            Scenario::SettingsRoundtrip,
            "settings-mismatch",
            format!("stored {record:?}, loaded {loaded:?}"),
        ));
    }

    let updated = SettingsRecord {
        theme: "slate".to_string(),
        ..record
    };
    log.save(updated.clone())
        .await
        .context(StorageValidationSnafu {
            stage: "settings-overwrite",
        })?;
    let reloaded = log
        .load("qa-user")
        .await
        .context(StorageValidationSnafu {
            stage: "settings-reload",
        })?;
    if reloaded != Some(updated) {
        return Err(fail(
            Scenario::SettingsRoundtrip,
            "settings-overwrite-mismatch",
            "second save must overwrite the first",
        ));
    }
    Ok(())
}

async fn run_settings_survive_rejoin(args: &RunnerArgs) -> RunnerResult<()> {
    let log = open_log(args, "settings-rejoin-open").await?;
    let record = SettingsRecord {
        username: "returning-user".to_string(),
        theme: "violet".to_string(),
        api_credential: "kept-credential".to_string(),
        behavior_instruction: "stay in character".to_string(),
    };
    log.save(record.clone())
        .await
        .context(StorageValidationSnafu {
            stage: "settings-rejoin-save",
        })?;

    // Clearing the chat log models the room being wiped between sessions;
    // the settings row is a separate lifetime and must not be touched.
    log.clear().await.context(StorageValidationSnafu {
        stage: "settings-rejoin-clear",
    })?;

    let loaded = log
        .load("returning-user")
        .await
        .context(StorageValidationSnafu {
            stage: "settings-rejoin-load",
        })?;
    if loaded != Some(record) {
        return Err(fail(
            Scenario::SettingsSurviveRejoin,
            "settings-rejoin-lost",
            "settings must survive a log clear",
        ));
    }
    Ok(())
}

async fn run_change_feed(args: &RunnerArgs) -> RunnerResult<()> {
    let log = open_log(args, "change-feed-open").await?;
    let mut events = log.subscribe();

    let record = log
        .append(user_draft("watched"))
        .await
        .context(StorageValidationSnafu {
            stage: "change-feed-append",
        })?;
    log.update(record.id, EntryPatch::text("watched, edited"))
        .await
        .context(StorageValidationSnafu {
            stage: "change-feed-update",
        })?;
    log.clear().await.context(StorageValidationSnafu {
        stage: "change-feed-clear",
    })?;

    let mut saw_create = false;
    let mut saw_update = false;
    let mut saw_clear = false;
    while let Some(event) = events.try_recv() {
        match event {
            LogEvent::Upserted(seen) if seen.id == record.id => {
                if seen.text == "watched" {
                    saw_create = true;
                } else if seen.text == "watched, edited" {
                    saw_update = true;
                }
            }
            LogEvent::Upserted(_) => {}
            LogEvent::Cleared => saw_clear = true,
        }
    }

    if !(saw_create && saw_update && saw_clear) {
        return Err(fail(
            Scenario::ChangeFeed,
            "change-feed-missing-events",
            format!("create={saw_create} update={saw_update} clear={saw_clear}"),
        ));
    }
    Ok(())
}

async fn run_scenario(scenario: Scenario, args: &RunnerArgs) -> RunnerResult<()> {
    match scenario {
        Scenario::SchemaInit => run_schema_init(args).await,
        Scenario::EntryRoundtrip => run_entry_roundtrip(args).await,
        Scenario::EntryUpdate => run_entry_update(args).await,
        Scenario::UpdateMissing => run_update_missing(args).await,
        Scenario::ClearAtomicity => run_clear_atomicity(args).await,
        Scenario::SettingsRoundtrip => run_settings_roundtrip(args).await,
        Scenario::SettingsSurviveRejoin => run_settings_survive_rejoin(args).await,
        Scenario::ChangeFeed => run_change_feed(args).await,
        Scenario::All => unreachable!("expanded by the caller"),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(error) => {
            eprintln!("log_qa_runner: {error}");
            eprintln!(
                "usage: log_qa_runner --scenario <name|all> [--db <path>]\n\
                 scenarios: schema_init entry_roundtrip entry_update update_missing \
                 clear_atomicity settings_roundtrip settings_survive_rejoin change_feed"
            );
            return ExitCode::from(2);
        }
    };

    let scenarios: Vec<Scenario> = match args.scenario {
        Scenario::All => Scenario::all().to_vec(),
        single => vec![single],
    };

    let mut failed = false;
    for scenario in scenarios {
        match run_scenario(scenario, &args).await {
            Ok(()) => println!("PASS {}", scenario.name()),
            Err(error) => {
                failed = true;
                println!("FAIL {}: {error}", scenario.name());
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
