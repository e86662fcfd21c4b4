use std::fs;
use std::io;
use std::path::Path;

/// Creates the parent directory of every output and writes the response
/// file, if the command has one, ahead of running it.
pub fn prepare_outputs(
    work_dir: &Path,
    outputs: &[String],
    rspfile: Option<(&str, &str)>,
) -> io::Result<()> {
    for output in outputs {
        if let Some(parent) = work_dir.join(output).parent() {
            fs::create_dir_all(parent)?;
        }
    }
    if let Some((name, content)) = rspfile {
        let path = work_dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
    }
    Ok(())
}

pub fn remove_rspfile(work_dir: &Path, name: &str) {
    if let Err(e) = fs::remove_file(work_dir.join(name)) {
        tracing::debug!(rspfile = name, error = %e, "Failed to remove response file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_output_dirs_and_rspfile() {
        let dir = tempfile::tempdir().unwrap();
        prepare_outputs(
            dir.path(),
            &["obj/deep/a.o".to_string()],
            Some(("obj/a.rsp", "-Iinclude a.c")),
        )
        .unwrap();

        assert!(dir.path().join("obj/deep").is_dir());
        assert_eq!(
            fs::read_to_string(dir.path().join("obj/a.rsp")).unwrap(),
            "-Iinclude a.c"
        );

        remove_rspfile(dir.path(), "obj/a.rsp");
        assert!(!dir.path().join("obj/a.rsp").exists());
    }
}
