use chirpdrop_core::*;
use std::fs;
use std::path::PathBuf;

fn main() {
    let web_constants_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("tools crate lives inside the workspace")
        .join("web/src/constants/signaling.ts");

    let content = format!(
        r#"// AUTO-GENERATED FILE - DO NOT EDIT MANUALLY
// Generated from core/src/lib.rs constants
// Run `cargo run --manifest-path tools/Cargo.toml` to regenerate

export const FRAME_SIZE_BYTES = {}
export const FRAME_HEADER_BYTES = {}
export const MAX_CREDENTIALS_BYTES = {}
export const DECODE_FAILED_SENTINEL = {}
export const DATA_CHANNEL_LABEL = "{}"
export const CHUNK_SIZE_BYTES = {}
export const MAX_BUFFERED_AMOUNT_BYTES = {}
export const BACKPRESSURE_RETRY_MS = {}
export const STATS_INTERVAL_MS = {}
"#,
        FRAME_SIZE,
        FRAME_HEADER_SIZE,
        MAX_CREDENTIALS_LEN,
        DECODE_FAILED_SENTINEL,
        DATA_CHANNEL_LABEL,
        CHUNK_SIZE,
        MAX_BUFFERED_AMOUNT,
        BACKPRESSURE_RETRY_MS,
        STATS_INTERVAL_MS
    );

    if let Some(dir) = web_constants_path.parent() {
        fs::create_dir_all(dir).expect("Failed to create web constants directory");
    }
    fs::write(&web_constants_path, content).expect("Failed to write web constants file");

    println!("Generated: {}", web_constants_path.display());
}
