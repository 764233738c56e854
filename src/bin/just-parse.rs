use anyhow::Result;
use clap::Parser;
use tracing::info;

#[derive(Debug, Parser)]
struct JustParse {
    /// Increase log output; repeat for more.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    filename: std::path::PathBuf,
}

fn main() -> Result<()> {
    let args = JustParse::parse();

    let level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let buffer = std::fs::read(&args.filename)?;
    let object = object::File::parse(&*buffer)?;

    let db = symboldb::parse_file(&object)?;
    info!("parsed {}", args.filename.display());

    println!("entries     {}", db.entry_count());
    println!("attributes  {}", db.attribute_count());
    println!("files       {}", db.files().count());
    println!("line rows   {}", db.locations().count());
    println!("loc lists   {}", db.loc_list_count());
    println!("range lists {}", db.range_list_count());
    println!("call frames {}", db.call_frames().count());
    for d in db.diagnostics() {
        println!("{}", d);
    }

    Ok(())
}
