//! apkseal - multi-scheme package signing
//!
//! Command-line front end over `apkseal-core`: sign a zip-shaped package
//! with the v2/v3/v3.1 schemes, verify an existing signing block, manage
//! rotation lineage files and generate signing keys.
#![allow(missing_docs)]

pub mod cmd;
pub mod zip;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "apkseal")]
#[command(author, version, about = "Sign and verify package signing blocks")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Sign a package
    Sign {
        /// Package to sign
        input: PathBuf,
        /// Where to write the signed package
        #[arg(short, long)]
        output: PathBuf,
        /// PKCS#8 DER private key; repeat for additional signers
        #[arg(long, required = true)]
        key: Vec<PathBuf>,
        /// Rotation target SDK for the key at the same position; 0 means
        /// untargeted
        #[arg(long)]
        target: Vec<u32>,
        /// Rotation lineage file
        #[arg(long)]
        lineage: Option<PathBuf>,
        /// Platform level at which a whole-package rotation takes effect
        #[arg(long)]
        rotation_min_sdk: Option<u32>,
        /// Skip the v2 entry
        #[arg(long)]
        no_v2: bool,
        /// Skip the v3 entry
        #[arg(long)]
        no_v3: bool,
        /// Skip the v3.1 entry
        #[arg(long)]
        no_v31: bool,
        /// Print the digest handoff for a streaming side-channel signer
        #[arg(long)]
        v4: bool,
        /// Keep unrecognized entries from an existing signing block
        #[arg(long)]
        preserve_foreign: bool,
        /// Minimum platform level the package supports
        #[arg(long, default_value_t = 1)]
        min_sdk: u32,
    },
    /// Verify a package's signing block
    Verify {
        /// Package to verify
        input: PathBuf,
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
        /// Lowest platform level to check
        #[arg(long, default_value_t = 1)]
        min_sdk: u32,
        /// Highest platform level to check
        #[arg(long, default_value_t = u32::MAX)]
        max_sdk: u32,
    },
    /// Manage rotation lineage files
    Lineage {
        #[command(subcommand)]
        command: LineageCommands,
    },
    /// Generate a signing keypair
    Keygen {
        /// Key algorithm
        #[arg(long, value_enum, default_value_t = KeyAlgorithm::Ed25519)]
        algorithm: KeyAlgorithm,
        /// Private key output path (PKCS#8 DER); the public key lands next
        /// to it with a .pub extension
        output: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
pub enum LineageCommands {
    /// Start a lineage at a root key
    Create {
        /// PKCS#8 DER private key of the root signer
        #[arg(long)]
        key: PathBuf,
        /// Where to write the lineage
        output: PathBuf,
    },
    /// Append a rotation to an existing lineage
    Rotate {
        /// Existing lineage file
        lineage: PathBuf,
        /// PKCS#8 DER private key of the current newest signer
        #[arg(long)]
        old_key: PathBuf,
        /// PKCS#8 DER private key of the new signer
        #[arg(long)]
        new_key: PathBuf,
        /// Capability bits recorded for the new signer
        #[arg(long)]
        caps: Option<u32>,
        /// Where to write the updated lineage
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print the nodes of a lineage file
    Inspect {
        /// Lineage file
        lineage: PathBuf,
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KeyAlgorithm {
    /// Ed25519
    Ed25519,
    /// ECDSA over P-256
    P256,
}
