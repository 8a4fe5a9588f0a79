use std::fs::File;
use std::io::{BufRead, BufReader};

use anyhow::Context;
use tokio::task::JoinSet;

use gokurou::cli::{Cli, Commands};
use gokurou::config::Config;
use gokurou::{logging, runtime, seeder};

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    if let Err(e) = run(cli).await {
        eprintln!("\nERROR DETECTED:\n   {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let path = cli
        .config
        .as_ref()
        .context("configuration file is required (-c PATH)")?;
    Config::load(path).context("failed to load configuration")
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Crawl => {
            let config = load_config(&cli)?;
            logging::init(&config);
            runtime::crawl(&config).await
        }

        Commands::Seeding { url, file } => {
            let config = load_config(&cli)?;
            logging::init(&config);

            let mut seed_urls = Vec::new();
            if let Some(url) = url {
                seed_urls.push(url.clone());
            }
            if let Some(file) = file {
                let reader = BufReader::new(
                    File::open(file).with_context(|| format!("failed to open {}", file))?,
                );
                for line in reader.lines() {
                    seed_urls.push(line.context("failed to load seed file")?);
                }
            }

            runtime::seeding(&config, seed_urls)
                .await
                .context("failed to seeding")
        }

        Commands::Reset => {
            let config = load_config(&cli)?;
            logging::init(&config);
            runtime::reset(&config).await
        }

        Commands::GenseedRss { urls } => {
            let config = load_config(&cli)?;
            let client = seeder::feed_client(&config.crawling.header_ua)?;

            let mut feeds = JoinSet::new();
            for url in urls.clone() {
                let client = client.clone();
                feeds.spawn(async move { seeder::fetch_rss_links(&client, &url).await });
            }

            // Successful feeds still print when another one fails; the last
            // error decides the exit status.
            let mut last_error = None;
            while let Some(joined) = feeds.join_next().await {
                match joined.context("feed task failed")? {
                    Ok(links) => {
                        for link in links {
                            println!("{}", link);
                        }
                    }
                    Err(e) => last_error = Some(e),
                }
            }

            match last_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        Commands::GenseedWiki { file } => {
            for url in seeder::sample_external_links(file)? {
                println!("{}", url);
            }
            Ok(())
        }
    }
}
