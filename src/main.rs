use std::env;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use ledgercore::engine::batch::BatchBuilder;
use ledgercore::engine::messages::InboxMessage;
use ledgercore::kernel::Machine;
use ledgercore::{CoreConfig, CoreError, KvStore, LedgerCore, MemoryStore, MessageStatus, ReferenceLoader};

/// Messages posted per mailbox batch.
const BATCH_SIZE: u64 = 16;

/// Messages per block in generated input.
const MESSAGES_PER_BLOCK: u64 = 4;

const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        print_usage();
        process::exit(2);
    }

    let image = Path::new(&args[2]);
    let result = match args[1].as_str() {
        "run" => match parse_u64(args.get(3)) {
            Some(count) => load_config(args.get(4)).and_then(|config| run_messages(image, count, config)),
            None => usage_error(),
        },
        "reorg" => match parse_u64(args.get(3)) {
            Some(count) => load_config(args.get(4)).and_then(|config| run_reorg(image, count, config)),
            None => usage_error(),
        },
        "inspect" => load_config(args.get(3)).and_then(|config| run_inspect(image, config)),
        _ => usage_error(),
    };

    if let Err(e) = result {
        eprintln!("FATAL: {}", e);
        process::exit(1);
    }
}

fn print_usage() {
    eprintln!("Usage: ledgercore <command> <image> [args]");
    eprintln!("Commands:");
    eprintln!("  run <image> <count> [config.json]     - Post <count> generated messages and execute them");
    eprintln!("  reorg <image> <count> [config.json]   - Drop messages past <count> and roll the machine back");
    eprintln!("  inspect <image> [config.json]         - Report stored state");
}

fn usage_error() -> Result<(), String> {
    print_usage();
    process::exit(2);
}

fn parse_u64(arg: Option<&String>) -> Option<u64> {
    arg.and_then(|s| s.parse().ok())
}

fn load_config(path: Option<&String>) -> Result<CoreConfig, String> {
    let path = match path {
        Some(p) => p,
        None => return Ok(CoreConfig::default()),
    };
    let text = fs::read_to_string(path).map_err(|e| format!("read config {}: {}", path, e))?;
    serde_json::from_str(&text).map_err(|e| format!("parse config {}: {}", path, e))
}

/// Open the store image and bring the core up from its latest checkpoint.
fn open_core(image: &Path, config: CoreConfig) -> Result<(Arc<MemoryStore>, LedgerCore), String> {
    let store = Arc::new(MemoryStore::open(image).map_err(|e| e.to_string())?);
    let core = LedgerCore::new(store.clone(), Arc::new(ReferenceLoader), config);
    core.initialize().map_err(|e| e.to_string())?;
    Ok((store, core))
}

fn close_core(store: &MemoryStore, core: LedgerCore) -> Result<(), String> {
    core.abort_thread();
    drop(core);
    store.sync().map_err(|e| e.to_string())
}

fn wait_for(what: &str, mut done: impl FnMut() -> Result<bool, String>) -> Result<(), String> {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !done()? {
        if Instant::now() >= deadline {
            return Err(format!("timed out waiting for {}", what));
        }
        thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

// =============================================================================
// COMMANDS
// =============================================================================

fn run_messages(image: &Path, count: u64, config: CoreConfig) -> Result<(), String> {
    let (store, core) = open_core(image, config)?;
    let mut builder = BatchBuilder::resume(store.snapshot().as_ref()).map_err(|e| e.to_string())?;
    let first = builder.next_sequence_number();
    core.start_thread().map_err(|e| e.to_string())?;
    println!("Posting {} messages starting at sequence {}", count, first);

    let mut posted = 0;
    while posted < count {
        let end = (posted + BATCH_SIZE).min(count);
        for i in posted..end {
            let seq = first + i;
            let data = if seq % 7 == 6 {
                format!("send:payout-{}", seq)
            } else {
                format!("tx-{}", seq)
            };
            let block = seq / MESSAGES_PER_BLOCK + 1;
            builder
                .sequencer(&InboxMessage::new(block, block, data))
                .map_err(|e| e.to_string())?;
        }
        if !core.deliver_messages(builder.finish()) {
            return Err("mailbox busy".to_string());
        }
        wait_for("ingestion", || match core.messages_status() {
            MessageStatus::Success | MessageStatus::Empty => Ok(true),
            MessageStatus::Ready => Ok(false),
            MessageStatus::Error => Err(core.messages_clear_error().unwrap_or_default()),
        })?;
        posted = end;
    }

    wait_for("execution", || match core.machine_error() {
        Some(e) => Err(format!("machine stalled: {}", e)),
        None => Ok(core.machine_idle() && core.machine_messages_read() >= first + count),
    })?;
    let saved = core.trigger_save_checkpoint().map_err(|e| e.to_string())?;
    info!(saved, "final checkpoint");

    print_state(&core).map_err(|e| e.to_string())?;
    close_core(&store, core)
}

fn run_reorg(image: &Path, count: u64, config: CoreConfig) -> Result<(), String> {
    let (store, core) = open_core(image, config)?;
    let restored = core
        .reorg_to_message_count_or_before(count, false)
        .map_err(|e| e.to_string())?;
    println!("Reorg to {} restored {} messages", count, restored);
    print_state(&core).map_err(|e| e.to_string())?;
    close_core(&store, core)
}

fn run_inspect(image: &Path, config: CoreConfig) -> Result<(), String> {
    let (_store, core) = open_core(image, config)?;
    print_state(&core).map_err(|e| e.to_string())?;
    if core.log_inserted_count().map_err(|e| e.to_string())? > 0 && core.config().logs_cursor_count > 0 {
        println!("Logs cursor 0 position: {}", core.logs_cursor_position(0).map_err(|e| e.to_string())?);
    }
    Ok(())
}

fn print_state(core: &LedgerCore) -> Result<(), CoreError> {
    println!("Messages stored:     {}", core.message_entry_inserted_count()?);
    println!("Messages processed:  {}", core.machine_messages_read());
    println!("Logs:                {}", core.log_inserted_count()?);
    println!("Sends:               {}", core.send_inserted_count()?);
    println!("Max checkpoint gas:  {}", core.max_checkpoint_gas()?);
    if let Some(machine) = core.get_last_machine() {
        println!("Machine gas:         {}", machine.gas_used());
        println!("Machine hash:        {}", hex(&machine.hash()));
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
