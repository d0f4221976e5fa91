use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use colorful::Colorful;
use webnovel_archiver::clean::SentenceFilterConfig;
use webnovel_archiver::cloud::{self, BackupOptions};
use webnovel_archiver::config::Config;
use webnovel_archiver::epub::EpubContents;
use webnovel_archiver::index::StoryIndex;
use webnovel_archiver::orchestrate::{self, RunEvent, RunOptions};
use webnovel_archiver::report;
use webnovel_archiver::workspace::migrate_legacy_index;
use webnovel_archiver::{MULTI_PROGRESS, init_logging};

#[derive(Parser)]
#[command(name = "wn-archiver", about = "Archives serialized web-fiction into EPUB volumes")]
struct Cli {
    /// Path to config/settings.ini, relative to the current directory.
    #[arg(long, global = true, default_value = "config/settings.ini")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch new chapters for a story and (re)build its EPUB.
    Archive {
        story_url: String,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        ebook_title_override: Option<String>,
        #[arg(long)]
        keep_temp_files: bool,
        #[arg(long)]
        force_reprocessing: bool,
        #[arg(long, conflicts_with = "no_sentence_removal")]
        sentence_removal_file: Option<PathBuf>,
        #[arg(long)]
        no_sentence_removal: bool,
        #[arg(long)]
        chapters_per_volume: Option<u32>,
        #[arg(long, value_enum, default_value_t = EpubContentsArg::All)]
        epub_contents: EpubContentsArg,
        #[arg(long)]
        chapter_limit: Option<u32>,
        #[arg(long)]
        resume_from_url: Option<String>,
    },
    /// Replicate progress files and generated EPUBs to a cloud backend.
    CloudBackup {
        #[arg(long)]
        story: Option<String>,
        #[arg(long, default_value = "local")]
        service: String,
        #[arg(long)]
        force_full_upload: bool,
    },
    /// Render the static HTML report over every archived story.
    GenerateReport,
    /// One-shot migration of a pre-Story-Index workspace.
    Migrate {
        #[arg(long)]
        story: Option<String>,
        #[arg(long, value_enum)]
        r#type: MigrateType,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum EpubContentsArg {
    All,
    ActiveOnly,
}

impl From<EpubContentsArg> for EpubContents {
    fn from(value: EpubContentsArg) -> Self {
        match value {
            EpubContentsArg::All => EpubContents::All,
            EpubContentsArg::ActiveOnly => EpubContents::ActiveOnly,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum MigrateType {
    RoyalroadLegacyId,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    let project_root = std::env::current_dir()?;
    let config = Config::load(&cli.config, &project_root)?;
    std::fs::create_dir_all(&config.workspace_path)?;

    let _log_guard = init_logging(&config.workspace_path);

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            tracing::warn!("interrupt received, finishing the current chapter then stopping");
            cancel.store(true, Ordering::SeqCst);
        })?;
    }

    let mut index = StoryIndex::load(&config.workspace_path)?;

    match cli.command {
        Command::Archive {
            story_url,
            output_dir,
            ebook_title_override,
            keep_temp_files,
            force_reprocessing,
            sentence_removal_file,
            no_sentence_removal,
            chapters_per_volume,
            epub_contents,
            chapter_limit,
            resume_from_url,
        } => {
            let workspace_root = output_dir.unwrap_or_else(|| config.workspace_path.clone());
            let sentence_filter = if no_sentence_removal {
                SentenceFilterConfig::default()
            } else {
                let path = sentence_removal_file.or(config.default_sentence_removal_file);
                path.map(|p| SentenceFilterConfig::load(&p)).unwrap_or_default()
            };

            let options = RunOptions {
                ebook_title_override,
                keep_temp_files,
                force_reprocessing,
                sentence_filter,
                chapters_per_volume,
                epub_contents: epub_contents.into(),
                chapter_limit,
                resume_from_url,
                ..RunOptions::default()
            };

            let bar = MULTI_PROGRESS.add(indicatif::ProgressBar::new_spinner());
            let result = orchestrate::run(&workspace_root, &mut index, &story_url, &options, &cancel, &|event| {
                report_event(&bar, &event);
            });

            bar.finish_and_clear();
            match result {
                Ok(record) => {
                    println!("{}", format!("archived: {}", record.title()).green());
                }
                Err(e) => {
                    eprintln!("{}", format!("archive failed: {e}").red());
                    return Err(e.into());
                }
            }
        }
        Command::CloudBackup { story, service, force_full_upload } => {
            let store = cloud::resolve_store(&service, &config.workspace_path)?;
            let outcomes = cloud::run_backup(
                store.as_ref(),
                &config.workspace_path,
                &mut index,
                story.as_deref(),
                BackupOptions { force_full_upload },
            )?;
            for outcome in &outcomes {
                if let Some(error) = &outcome.error {
                    eprintln!("{}", format!("{}: {error}", outcome.permanent_id).red());
                } else if outcome.skipped {
                    println!("{}: up to date", outcome.permanent_id);
                } else {
                    println!(
                        "{}",
                        format!("{}: uploaded {} file(s)", outcome.permanent_id, outcome.uploaded_files).green()
                    );
                }
            }
        }
        Command::GenerateReport => {
            let path = report::generate(&config.workspace_path, &mut index)?;
            println!("{}", format!("report written to {}", path.display()).green());
        }
        Command::Migrate { story, r#type: MigrateType::RoyalroadLegacyId } => {
            let migrated = migrate_legacy_index(&config.workspace_path, &mut index, |story_url| {
                let permanent_id = webnovel_archiver::fetch::get(story_url).ok()?.permanent_id(story_url).ok()?;
                if let Some(target) = &story {
                    if &permanent_id != target {
                        return None;
                    }
                }
                Some(permanent_id)
            })?;
            println!("{}", format!("migrated {migrated} stor{}", if migrated == 1 { "y" } else { "ies" }).green());
        }
    }

    Ok(())
}

fn report_event(bar: &indicatif::ProgressBar, event: &RunEvent) {
    match event {
        RunEvent::FetchingMetadata => bar.set_message("fetching metadata..."),
        RunEvent::Reconciled { work_queue_len, total_chapters } => {
            bar.set_message(format!("{work_queue_len} of {total_chapters} chapters to download"));
        }
        RunEvent::Downloading { total } => bar.set_message(format!("downloading {total} chapter(s)...")),
        RunEvent::BuildingEpub => bar.set_message("building epub..."),
        RunEvent::Done { generated } => bar.set_message(format!("done, {} epub file(s) generated", generated.len())),
    }
}
