use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;

use treespec::Keyword;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CommandLineArgs {
    /// Create a directory hierarchy manifest
    #[arg(short = 'c')]
    pub create: bool,

    /// Directory hierarchy manifest to create or validate against
    #[arg(short = 'f', value_name = "FILE")]
    pub file: Option<Utf8PathBuf>,

    /// Root path that the manifest is relative to
    #[arg(short = 'p', value_name = "ROOT", default_value = ".")]
    pub path: Utf8PathBuf,

    /// Use the specified (comma or space delimited) keywords as the current
    /// set of keywords
    #[arg(short = 'k', value_name = "KEYWORDS")]
    pub use_keywords: Option<String>,

    /// Add the specified (comma or space delimited) keywords to the current
    /// set of keywords
    #[arg(short = 'K', value_name = "KEYWORDS")]
    pub add_keywords: Option<String>,

    /// Modify the owner, group, permissions and xattrs of files, symbolic
    /// links and devices, to match the provided manifest. Not compatible
    /// with -T
    #[arg(short = 'u')]
    pub update_attributes: bool,

    /// Use a tar archive to create or validate a directory hierarchy
    /// manifest ("-" indicates stdin)
    #[arg(short = 'T', value_name = "TAR")]
    pub tar: Option<String>,

    /// Only operate on keywords that are supported by upstream mtree(8)
    #[arg(long = "bsd-keywords")]
    pub bsd_keywords: bool,

    /// List the keywords available
    #[arg(long = "list-keywords")]
    pub list_keywords: bool,

    /// List all the keywords found in a validation manifest
    #[arg(long = "list-used")]
    pub list_used: bool,

    /// Output the validation results using the given format
    #[arg(long = "result-format", value_enum, default_value_t = ResultFormat::Bsd)]
    pub result_format: ResultFormat,

    /// Increase logging verbosity level (0: warn; 1: info; 2: debug; 3: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultFormat {
    Bsd,
    Json,
    Path,
}

/// Parses a comma- or space-delimited keyword list argument.
pub fn split_keywords_arg(arg: &str) -> Result<Vec<Keyword>> {
    arg.replace(',', " ")
        .split_whitespace()
        .map(|word| word.parse())
        .collect()
}
