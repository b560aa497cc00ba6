//! Test fixtures shared across modules: stand-in shell scripts for the
//! external tools.

use std::path::{Path, PathBuf};

/// Writes an executable `/bin/sh` script named `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Merge tool stand-in: `-w <out> <inputs>...` concatenates the inputs and
/// records the argument count in `<out>.argc`.
pub fn fake_merge_tool(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "fake-mergecap",
        r#"[ "$1" = "-w" ] || exit 2
out="$2"
shift 2
echo "$#" > "$out.argc"
cat "$@" > "$out""#,
    )
}

/// Capture tool stand-in: writes a one-line segment to the path after `-w`.
pub fn fake_capture_tool(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "fake-capture",
        r#"out=""
while [ "$#" -gt 0 ]; do
  if [ "$1" = "-w" ]; then out="$2"; fi
  shift
done
[ -n "$out" ] || exit 2
echo "packet" > "$out""#,
    )
}

pub const VERDICT_HEADER: &str =
    "Model,Time,Packets,Samples,DDOS%,Accuracy,F1Score,TPR,FPR,TNR,FNR,Source";

/// Classifier stand-in: records its pid in `<dir>/classifier.pid`, creates
/// the result file header first, waits `delay` seconds, then appends `row`
/// and keeps running until killed.
pub fn fake_classifier(dir: &Path, output_dir: &Path, delay: &str, row: &str) -> PathBuf {
    write_script(
        dir,
        "fake-classifier",
        &format!(
            r#"echo $$ > "{pidfile}"
out="{out}/predictions-$$.csv"
echo "{header}" > "$out"
sleep {delay}
echo "{row}" >> "$out"
exec sleep 600"#,
            pidfile = dir.join("classifier.pid").display(),
            out = output_dir.display(),
            header = VERDICT_HEADER,
            delay = delay,
            row = row,
        ),
    )
}

/// Writes a little-endian Ethernet capture file holding one minimal IPv4
/// packet per entry of `sources`, each addressed to 10.0.0.1.
pub fn write_pcap(path: &Path, sources: &[[u8; 4]]) {
    let mut data = Vec::new();
    data.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    data.extend_from_slice(&2u16.to_le_bytes());
    data.extend_from_slice(&4u16.to_le_bytes());
    data.extend_from_slice(&0i32.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&65_535u32.to_le_bytes());
    data.extend_from_slice(&1u32.to_le_bytes());

    for (i, source) in sources.iter().enumerate() {
        let mut frame = vec![0u8; 14 + 20];
        frame[12] = 0x08;
        frame[14] = 0x45;
        frame[17] = 20;
        frame[22] = 64;
        frame[23] = 253;
        frame[26..30].copy_from_slice(source);
        frame[30..34].copy_from_slice(&[10, 0, 0, 1]);

        data.extend_from_slice(&(1_700_000_000u32 + i as u32).to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        data.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        data.extend_from_slice(&frame);
    }

    std::fs::write(path, data).unwrap();
}
