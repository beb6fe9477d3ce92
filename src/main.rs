use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use std::collections::BTreeSet;
use std::path::PathBuf;

use duojournal::cache::{CacheResult, CacheSource};
use duojournal::{journal, logging, Config, Identity, MemoryPatch, MemoryRecord, NewMemory};

#[derive(Parser, Debug)]
#[command(name = "duojournal")]
#[command(about = "A shared memory journal for two, usable offline")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/duojournal/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Act as this identity instead of the configured one
  #[arg(long = "as", global = true)]
  identity: Option<Identity>,

  /// Log to stderr instead of the log file
  #[arg(long, global = true)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List all memories, newest first
  List,
  /// Show one memory
  Show { id: String },
  /// Write a new memory
  Add {
    /// Text of the memory; may be empty when an image is attached
    #[arg(default_value = "")]
    content: String,
    /// Author (defaults to the active identity)
    #[arg(long)]
    author: Option<Identity>,
    #[arg(short, long = "tag")]
    tags: Vec<String>,
    /// Image file to attach; may be repeated
    #[arg(short, long = "image")]
    images: Vec<PathBuf>,
  },
  /// Change the text or tags of a memory
  Edit {
    id: String,
    #[arg(long)]
    content: Option<String>,
    /// Replace the tags; may be repeated
    #[arg(short, long = "tag")]
    tags: Vec<String>,
    /// Remove all tags
    #[arg(long, conflicts_with = "tags")]
    clear_tags: bool,
  },
  /// Delete a memory
  Delete { id: String },
  /// Insert the example memories into an empty journal
  Seed,
  /// Discard every locally cached memory on this device
  ResetCache,
  /// Show whether your partner is online until interrupted
  Presence,
}

fn format_time(created_at: i64) -> String {
  chrono::DateTime::from_timestamp_millis(created_at)
    .map(|t| {
      t.with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M")
        .to_string()
    })
    .unwrap_or_else(|| "-".to_string())
}

fn print_record(record: &MemoryRecord) {
  let tags = if record.tags.is_empty() {
    String::new()
  } else {
    let tags: Vec<&str> = record.tags.iter().map(String::as_str).collect();
    format!("  [{}]", tags.join(", "))
  };
  println!(
    "{}  {}  {}  {}{}",
    record.id,
    format_time(record.created_at),
    record.author,
    record.content,
    tags
  );
  for url in &record.image_urls {
    println!("    image: {}", url);
  }
}

fn print_list(result: &CacheResult<Vec<MemoryRecord>>) {
  if result.source == CacheSource::Offline {
    match &result.stale_reason {
      Some(e) if e.is_remote() => eprintln!("(offline: showing saved memories; {})", e),
      Some(e) => eprintln!("(showing saved memories; {})", e),
      None => eprintln!("(showing saved memories)"),
    }
  }
  if result.data.is_empty() {
    println!("No memories yet.");
  }
  for record in &result.data {
    print_record(record);
  }
}

fn active_identity(args_identity: Option<Identity>, config: &Config) -> Result<Identity> {
  args_identity
    .or(config.identity)
    .ok_or_else(|| eyre!("No identity chosen: set `identity` in the config or pass --as"))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let _log_guard = if args.log_stderr {
    logging::init_stderr();
    None
  } else {
    logging::init_file()
  };

  let config = Config::load(args.config.as_deref())?;

  let journal = journal::open(&config)?;

  match args.command {
    Command::List => {
      let result = journal.init().await;
      print_list(&result);
    }
    Command::Show { id } => match journal.read(&id).await? {
      Some(record) => print_record(&record),
      None => println!("No memory with id {}", id),
    },
    Command::Add {
      content,
      author,
      tags,
      images,
    } => {
      let author = match author {
        Some(author) => author,
        None => active_identity(args.identity, &config)?,
      };
      let mut memory = NewMemory::new(author, content);
      for tag in tags {
        memory = memory.with_tag(tag);
      }

      let mut bytes = Vec::with_capacity(images.len());
      for path in &images {
        let data = std::fs::read(path)
          .wrap_err_with(|| format!("Failed to read image {}", path.display()))?;
        bytes.push(data);
      }

      let record = if bytes.is_empty() {
        journal.create(memory).await?
      } else {
        journal.create_with_images(memory, bytes).await?
      };
      print_record(&record);
    }
    Command::Edit {
      id,
      content,
      tags,
      clear_tags,
    } => {
      let tags = if clear_tags {
        Some(BTreeSet::new())
      } else if tags.is_empty() {
        None
      } else {
        Some(tags.into_iter().collect())
      };
      let patch = MemoryPatch {
        content,
        image_urls: None,
        tags,
      };
      let record = journal.update(&id, patch).await?;
      print_record(&record);
    }
    Command::Delete { id } => {
      if journal.delete(&id).await? {
        println!("Deleted {}", id);
      } else {
        println!("{} was already gone", id);
      }
    }
    Command::Seed => {
      let inserted = journal.seed_if_empty().await?;
      println!("Inserted {} example memories", inserted);
    }
    Command::ResetCache => {
      journal.reset_local_cache()?;
      println!("Local cache cleared");
    }
    Command::Presence => {
      let identity = active_identity(args.identity, &config)?;
      run_presence(&config, identity).await?;
    }
  }

  journal.dispose();
  Ok(())
}

async fn run_presence(config: &Config, identity: Identity) -> Result<()> {
  let channel = journal::presence(config);
  let subscription = channel.subscribe(move |status| {
    if status.partner_online {
      let partner = status.partner.unwrap_or(identity.other());
      println!("{} is online", partner);
    } else {
      println!("{} is offline", identity.other());
    }
  });

  channel.join(identity);
  println!("Joined as {} (Ctrl-C to leave)", identity);

  tokio::signal::ctrl_c()
    .await
    .wrap_err("Failed to listen for Ctrl-C")?;

  subscription.unsubscribe();
  channel.leave().await;
  Ok(())
}
