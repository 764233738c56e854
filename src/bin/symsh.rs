use std::fmt::Display;

use anyhow::Result;
use clap::Parser;
use regex::Regex;

use symboldb::{CfiRuleKind, DebugInfoEntry, SymbolDb, CFA_REGISTER};

/// Interactive shell over the symbol database of a program.
#[derive(Debug, Parser)]
struct SymSh {
    /// Increase log output; repeat for more.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    filename: std::path::PathBuf,
}

fn main() -> Result<()> {
    let args = SymSh::parse();
    setup_logger(args.verbose)?;

    let buffer = std::fs::read(args.filename)?;
    let object = object::File::parse(&*buffer)?;
    let everything = symboldb::parse_file(&object)?;

    println!(
        "Loaded; {} entries, {} line rows, {} call frames.",
        everything.entry_count(),
        everything.locations().count(),
        everything.call_frames().count(),
    );
    if !everything.diagnostics().is_empty() {
        println!(
            "{}{} problems found while loading, see: diag",
            ansi_term::Colour::Yellow.paint("note: "),
            everything.diagnostics().len(),
        );
    }
    println!("To quit: ^D or exit");

    let mut rl = rustyline::DefaultEditor::new()?;
    let prompt = ansi_term::Colour::Green.paint(">> ").to_string();
    'lineloop:
    loop {
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                let (cmd, rest) = line.split_once(char::is_whitespace)
                    .unwrap_or((line, ""));
                if line.is_empty() {
                    continue 'lineloop;
                }

                let _ = rl.add_history_entry(line);

                match cmd {
                    "exit" => break,
                    "help" => {
                        println!("commands:");
                        for (name, _, desc) in COMMANDS {
                            println!("{:12} {}", name, desc);
                        }
                    }
                    _ => {
                        for (name, imp, _) in COMMANDS {
                            if *name == cmd {
                                imp(&everything, rest.trim());
                                continue 'lineloop;
                            }
                        }
                        println!("unknown command: {}", cmd);
                        println!("for help, try: help");
                    }
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                println!("{:?}", e);
                break;
            }
        }
    }

    Ok(())
}

fn setup_logger(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => tracing::Level::ERROR,
        1 => tracing::Level::WARN,
        2 => tracing::Level::INFO,
        3 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Displays an entry as its name (if any) and `.debug_info` offset.
struct NamedEntry<'a>(&'a DebugInfoEntry);

impl std::fmt::Display for NamedEntry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let bold = ansi_term::Style::new().bold();
        let dim = ansi_term::Style::new().dimmed();

        let n = self.0.name().unwrap_or("<anonymous>");
        write!(f, "{} {}", self.0.tag, bold.paint(n))?;
        write!(f, " {}<.debug_info+0x{:08x}>{}", dim.prefix(), self.0.key, dim.suffix())
    }
}

type Command = fn(&SymbolDb, &str);

static COMMANDS: &[(&str, Command, &str)] = &[
    ("addr2line", cmd_addr2line, "look up line number information"),
    ("scope", cmd_scope, "show the lexical scopes active at an address"),
    ("func", cmd_func, "name the function containing an address"),
    ("line2addr", cmd_line2addr, "find code addresses for file:line"),
    ("steps", cmd_steps, "list line row addresses of the function at an address"),
    ("frame", cmd_frame, "get call frame rules for an address"),
    ("lines", cmd_lines, "list line rows of a scope (by offset), in line order"),
    ("entry", cmd_entry, "print an entry and its attributes"),
    ("children", cmd_children, "list the children of an entry"),
    ("ancestors", cmd_ancestors, "find the nearest enclosing entry with a tag"),
    ("files", cmd_files, "list source files, or those matching a regex"),
    ("stats", cmd_stats, "print table sizes"),
    ("diag", cmd_diag, "print problems found while loading"),
];

fn parse_number(args: &str, what: &str) -> Option<u64> {
    match parse_int::parse::<u64>(args) {
        Ok(n) => Some(n),
        Err(_) => {
            println!("can't parse {} as {}", args, what);
            None
        }
    }
}

fn lookup_entry<'a>(db: &'a SymbolDb, args: &str) -> Option<&'a DebugInfoEntry> {
    let offset = parse_number(args, "an offset")?;
    let entry = db.entry(offset);
    if entry.is_none() {
        println!("{}", ansi_term::Colour::Red.paint("No entry at that offset."));
    }
    entry
}

fn cmd_addr2line(db: &SymbolDb, args: &str) {
    let Some(addr) = parse_number(args, "an address") else {
        return;
    };

    if let Some(row) = db.location_for_address(addr) {
        let end = row.start_address + row.length;
        if addr >= end {
            print!("{}", ansi_term::Colour::Yellow.paint("(past end of row) "));
        }
        match db.file(row.source_file_key) {
            Some(file) => print!("{}:", file.current_absolute_path),
            None => print!("???:"),
        }
        println!("{}:{}", row.line, row.column);
        println!("- row covers {:#x}..{:#x}", row.start_address, end);
    } else {
        println!("no line number information available for address");
    }
}

fn cmd_scope(db: &SymbolDb, args: &str) {
    let Some(addr) = parse_number(args, "an address") else {
        return;
    };

    let Some(mut scope) = db.scope_for_address(addr) else {
        println!("address is not inside any scope");
        return;
    };
    let mut depth = 0;
    loop {
        println!("{:width$}{}", "", NamedEntry(scope), width = depth * 2);
        let Some(outer) = scope.outer_scope.and_then(|k| db.entry(k)) else {
            break;
        };
        scope = outer;
        depth += 1;
    }
}

fn cmd_func(db: &SymbolDb, args: &str) {
    let Some(addr) = parse_number(args, "an address") else {
        return;
    };

    match db.function_for_address(addr) {
        Some(f) => println!("{}", NamedEntry(f)),
        None => println!("address is not inside any function"),
    }
}

fn cmd_line2addr(db: &SymbolDb, args: &str) {
    let Some((path, line)) = args.rsplit_once(':') else {
        println!("usage: line2addr FILE:LINE");
        return;
    };
    let Some(line) = parse_number(line, "a line number") else {
        return;
    };
    let Ok(line) = u32::try_from(line) else {
        println!("line number out of range");
        return;
    };

    let addresses = db.addresses_for_line(path, line);
    if addresses.is_empty() {
        println!("no code for {}:{}", path, line);
    }
    for a in addresses {
        match db.function_for_address(a) {
            Some(f) => println!("{:#x} in {}", a, NamedEntry(f)),
            None => println!("{:#x}", a),
        }
    }
}

fn cmd_steps(db: &SymbolDb, args: &str) {
    let Some(addr) = parse_number(args, "an address") else {
        return;
    };

    let addresses = db.addresses_in_scope(addr);
    if addresses.is_empty() {
        println!("address is not inside any scope");
    }
    for a in addresses {
        match db.position_for_address(a) {
            Some((file, row)) => println!("{:#x} {}:{}", a, file.filename, row.line),
            None => println!("{:#x}", a),
        }
    }
}

fn cmd_frame(db: &SymbolDb, args: &str) {
    let Some(addr) = parse_number(args, "an address") else {
        return;
    };

    let Some(frame) = db.call_frame_for_address(addr) else {
        println!("no call frame information for address");
        return;
    };
    println!("frame description at {:#x}", frame.address);
    for rule in frame.rules_at(addr) {
        if rule.register == CFA_REGISTER {
            print!("cfa: ");
        } else {
            print!("  caller reg #{} ", rule.register);
        }
        match &rule.kind {
            CfiRuleKind::Undefined => println!("undefined"),
            CfiRuleKind::SameValue => println!("preserved"),
            CfiRuleKind::Offset { base_register, offset } => {
                println!("at {}{:+}", RegName(*base_register), offset);
            }
            CfiRuleKind::ValOffset { base_register, offset } => {
                println!("= {}{:+}", RegName(*base_register), offset);
            }
            CfiRuleKind::Register { base_register } => {
                println!("in {}", RegName(*base_register));
            }
            CfiRuleKind::Expression(e) => println!("at expr {:02x?}", e),
            CfiRuleKind::ValExpression(e) => println!("= expr {:02x?}", e),
        }
    }
}

struct RegName(i32);

impl Display for RegName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.0 == CFA_REGISTER {
            f.write_str("CFA")
        } else {
            write!(f, "reg #{}", self.0)
        }
    }
}

fn cmd_lines(db: &SymbolDb, args: &str) {
    let Some(scope) = lookup_entry(db, args) else {
        return;
    };

    let Some(rows) = db.locations_by_line(scope) else {
        println!("no line rows inside {}", NamedEntry(scope));
        return;
    };
    for row in rows {
        println!("{:6}:{:<4} {:#x}", row.line, row.column, row.start_address);
    }
}

fn cmd_entry(db: &SymbolDb, args: &str) {
    let Some(entry) = lookup_entry(db, args) else {
        return;
    };

    println!("{}", NamedEntry(entry));
    println!("- parent: 0x{:08x}", entry.parent_key);
    match entry.outer_scope.and_then(|k| db.entry(k)) {
        Some(outer) => println!("- enclosing scope: {}", NamedEntry(outer)),
        None => println!("- not inside any scope"),
    }
    for attr in db.attributes_of(entry.key) {
        println!("  {} ({}): {:x?}", attr.tag, attr.form, attr.value);
    }
    let ranges = db.ranges_for_entry(entry.key);
    if !ranges.is_empty() {
        println!("- ranges:");
        for r in ranges {
            println!(
                "  {:#x}..{:#x}",
                r.base_address + r.low_pc,
                r.base_address + r.high_pc,
            );
        }
    }
}

fn cmd_children(db: &SymbolDb, args: &str) {
    let Some(offset) = parse_number(args, "an offset") else {
        return;
    };

    let mut any = false;
    for child in db.children_of(offset) {
        println!("{}", NamedEntry(child));
        any = true;
    }
    if !any {
        println!("no children");
    }
}

fn cmd_ancestors(db: &SymbolDb, args: &str) {
    let (offset, tag) = args.split_once(char::is_whitespace)
        .unwrap_or((args, "DW_TAG_subprogram"));
    let Some(entry) = lookup_entry(db, offset) else {
        return;
    };
    let tag = tag.trim();
    let Some(tag) = TAGS.iter().find(|t| t.static_string() == Some(tag)) else {
        println!("unknown tag: {}", tag);
        return;
    };

    match db.nearest_ancestor_with_tag(entry, *tag) {
        Some(a) => println!("{}", NamedEntry(a)),
        None => println!("no enclosing {}", tag),
    }
}

/// Tags that can be searched for by name.
static TAGS: &[gimli::DwTag] = &[
    gimli::DW_TAG_compile_unit,
    gimli::DW_TAG_subprogram,
    gimli::DW_TAG_lexical_block,
    gimli::DW_TAG_inlined_subroutine,
    gimli::DW_TAG_namespace,
    gimli::DW_TAG_structure_type,
];

fn cmd_files(db: &SymbolDb, args: &str) {
    let filter = if args.is_empty() {
        None
    } else {
        match Regex::new(args) {
            Ok(re) => Some(re),
            Err(e) => {
                println!("bad pattern: {}", e);
                return;
            }
        }
    };

    for file in db.files() {
        if let Some(re) = &filter {
            if !re.is_match(&file.current_absolute_path) {
                continue;
            }
        }
        println!(
            "{:#018x} {} ({} rows)",
            file.key,
            file.current_absolute_path,
            db.locations_in_file(file.key).count(),
        );
    }
}

fn cmd_stats(db: &SymbolDb, _args: &str) {
    println!("entries:       {}", db.entry_count());
    println!("attributes:    {}", db.attribute_count());
    println!("files:         {}", db.files().count());
    println!("line rows:     {}", db.locations().count());
    println!("transitions:   {}", db.scope_transitions().count());
    println!("loc lists:     {}", db.loc_list_count());
    println!("range lists:   {}", db.range_list_count());
    println!("call frames:   {}", db.call_frames().count());
    println!("functions:     {}", db.entries().filter(|e| e.tag == gimli::DW_TAG_subprogram).count());
}

fn cmd_diag(db: &SymbolDb, _args: &str) {
    if db.diagnostics().is_empty() {
        println!("no problems");
    }
    for d in db.diagnostics() {
        println!("{}", d);
    }
}
