use clap::{Parser, Subcommand};

/// gokurou cli
#[derive(Parser)]
#[command(name = "gokurou")]
#[command(about = "Let's crawl web!")]
#[command(version)]
pub struct Cli {
    /// configuration file PATH
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Seeding initial URL
    Seeding {
        /// seed URL
        #[arg(short, long, value_name = "URL")]
        url: Option<String>,

        /// FILE containing seed URLs, one per line
        #[arg(short, long, value_name = "FILE")]
        file: Option<String>,
    },

    /// Start to crawl
    Crawl,

    /// Reset all data (artifacts excluded)
    Reset,

    /// Generate seed list from links in RSS 1.0 (XML)
    GenseedRss {
        /// RSS feed URLs
        #[arg(value_name = "URL", required = true)]
        urls: Vec<String>,
    },

    /// Generate seed list from externallinks.sql (Wikipedia dumps)
    GenseedWiki {
        /// path to FILE containing externallinks.sql of Wikipedia
        #[arg(short, long, value_name = "FILE")]
        file: String,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
