use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use llama2_inference::{InferenceConfigBuilder, run_inference};
use log::error;

/// Define the command-line interface.
fn cli() -> Command {
    Command::new("llama2")
        .about("Llama2 inference in Rust")
        .arg(Arg::new("checkpoint").help("Model checkpoint file").required(true).index(1))
        .arg(
            Arg::new("tokenizer")
                .short('z')
                .long("tokenizer")
                .value_name("PATH")
                .help("Tokenizer vocabulary file")
                .default_value("tokenizer.bin"),
        )
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .help("Temperature for sampling in [0, inf], default 1.0")
                .default_value("1.0")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("topp")
                .short('p')
                .long("topp")
                .value_name("FLOAT")
                .help("Top-p for nucleus sampling in [0,1], default 0.9")
                .default_value("0.9")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed, default current time")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("steps")
                .short('n')
                .long("steps")
                .value_name("INT")
                .help("Number of steps to run for, (default) = max_seq_len - 1")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("INT")
                .help("Context window size, (default) = max_seq_len")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("STRING")
                .help("Input prompt"),
        )
}

/// Run inference with the provided arguments
fn run_inference_command(matches: &ArgMatches) -> Result<()> {
    let config = InferenceConfigBuilder::default()
        .checkpoint_path(matches.get_one::<String>("checkpoint"))
        .tokenizer_path(matches.get_one::<String>("tokenizer"))
        .temperature(matches.get_one::<f32>("temperature").copied())
        .topp(matches.get_one::<f32>("topp").copied())
        .steps(matches.get_one::<usize>("steps").copied())
        .ctx_length(matches.get_one::<usize>("context").copied())
        .prompt(matches.get_one::<String>("input"))
        .seed(matches.get_one::<u64>("seed").copied())
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    run_inference(config).map_err(|e| anyhow::anyhow!("Inference failed: {e}"))?;

    Ok(())
}

fn execute_commands() -> Result<()> {
    // Initialize logger with clean format (no timestamp/module prefix)
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = cli().get_matches();
    run_inference_command(&matches)
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e}");
        std::process::exit(1);
    }
}
