//! Shell wrapper generation.
//!
//! Every firing executes through a generated `.command.sh`: env exports,
//! stage-in links, the user command (optionally wrapped in a container
//! invocation), exit-status capture to `.exitcode` and merged output to
//! `.command.out`. The wrapper is written once before submission and never
//! rewritten.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use crate::staging::FileHolder;
use crate::task::{TaskRun, ENV_FILE, OUT_FILE, STDIN_FILE};
use crate::trie::PathTrie;

/// Generated body file for scripts that declare their own interpreter.
pub const CODE_FILE: &str = ".command.code";

/// Split a leading `#!` line off a script body.
pub fn split_shebang(script: &str) -> (Option<String>, String) {
    let trimmed = script.trim_start_matches(['\n', ' ']);
    if let Some(rest) = trimmed.strip_prefix("#!") {
        let mut lines = rest.splitn(2, '\n');
        let interp = lines.next().unwrap_or("").trim().to_string();
        let body = lines.next().unwrap_or("").to_string();
        (Some(interp), body)
    } else {
        (None, script.to_string())
    }
}

/// `export K="V"` lines for the declared env inputs.
pub fn env_exports(env: &[(String, String)]) -> String {
    let mut out = String::new();
    for (key, value) in env {
        out.push_str(&format!("export {}=\"{}\"\n", key, shell_escape(value)));
    }
    out
}

/// `K=V` body of `.command.env`, the container-mode replacement for
/// inline exports.
pub fn env_file_body(env: &[(String, String)]) -> String {
    let mut out = String::new();
    for (key, value) in env {
        out.push_str(&format!("{key}={value}\n"));
    }
    out
}

/// Symlink stage-in lines for every holder, relative to the work dir.
pub fn stage_in_lines(holders: &[FileHolder]) -> String {
    let mut out = String::new();
    for holder in holders {
        if let Some(parent) = PathBuf::from(&holder.stored_name).parent() {
            if !parent.as_os_str().is_empty() {
                out.push_str(&format!("mkdir -p \"{}\"\n", parent.display()));
            }
        }
        out.push_str(&format!(
            "rm -f \"{}\"\nln -s \"{}\" \"{}\"\n",
            holder.stored_name,
            holder.source.display(),
            holder.stored_name
        ));
    }
    out
}

/// Wrap `inner` in a container run with mounts covering the staged sources
/// and the work dir.
pub fn container_invocation(image: &str, staged: &[FileHolder], inner: &str) -> String {
    let mut trie = PathTrie::new();
    for holder in staged {
        trie.add(&holder.source);
    }
    let mut cmd = String::from("docker run -i --rm");
    cmd.push_str(&format!(" --env-file {ENV_FILE}"));
    for mount in trie.mount_points() {
        cmd.push_str(&format!(" -v \"{0}\":\"{0}\"", mount.display()));
    }
    cmd.push_str(" -v \"$PWD\":\"$PWD\" -w \"$PWD\"");
    cmd.push_str(&format!(" {image} /bin/bash -c \"{}\"", shell_escape(inner)));
    cmd
}

/// The user-command block: the script itself, or the interpreter invoking
/// the generated code file.
fn user_command(task: &TaskRun) -> String {
    match &task.shebang {
        Some(interp) => format!("{interp} {CODE_FILE}"),
        None => task.script.trim_end().to_string(),
    }
}

/// Generate the wrapper text for a task.
pub fn build(task: &TaskRun) -> String {
    let mut text = String::from("#!/bin/bash\n");
    text.push_str(&format!("# weir task: {}\n", task.display_name()));

    if task.container.is_none() && !task.env.is_empty() {
        text.push('\n');
        text.push_str(&env_exports(&task.env));
    }

    if !task.embedded_staging && !task.staged.is_empty() {
        text.push('\n');
        text.push_str("# stage in\n");
        text.push_str(&stage_in_lines(&task.staged));
    }

    let command = match &task.container {
        Some(image) => container_invocation(image, &task.staged, &user_command(task)),
        None => user_command(task),
    };

    let stdin_redirect = if task.stdin.is_some() {
        format!(" < {STDIN_FILE}")
    } else {
        String::new()
    };

    text.push_str(&format!(
        "\n(\n{command}\n) > {OUT_FILE} 2>&1{stdin_redirect}\nstatus=$?\necho $status > .exitcode\nexit $status\n"
    ));
    text
}

/// Create the work dir and write every generated file: wrapper, env file
/// (container mode), stdin, code file, merge aux files.
pub fn materialize(task: &TaskRun) -> io::Result<PathBuf> {
    fs::create_dir_all(&task.work_dir)?;

    if task.container.is_some() {
        fs::write(task.env_file(), env_file_body(&task.env))?;
    }
    if let Some(stdin) = &task.stdin {
        fs::write(task.stdin_file(), stdin)?;
    }
    if task.shebang.is_some() {
        fs::write(task.work_dir.join(CODE_FILE), &task.script)?;
    }
    for (name, content) in &task.aux_files {
        let path = task.work_dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
    }

    let wrapper = task.wrapper_path();
    fs::write(&wrapper, build(task))?;
    fs::set_permissions(&wrapper, fs::Permissions::from_mode(0o744))?;
    Ok(wrapper)
}

fn shell_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRun;
    use std::path::PathBuf;

    fn task() -> TaskRun {
        let mut task = TaskRun::new("hello", 1, 1);
        task.work_dir = PathBuf::from("/tmp/work/ab/cd");
        task.script = "echo 42".into();
        task
    }

    #[test]
    fn wrapper_captures_exit_and_output() {
        let text = build(&task());
        assert!(text.starts_with("#!/bin/bash\n"));
        assert!(text.contains("echo 42"));
        assert!(text.contains("> .command.out 2>&1"));
        assert!(text.contains("echo $status > .exitcode"));
        assert!(text.ends_with("exit $status\n"));
    }

    #[test]
    fn env_inputs_export_inline_without_container() {
        let mut t = task();
        t.env.push(("SAMPLE".into(), "x1".into()));
        let text = build(&t);
        assert!(text.contains("export SAMPLE=\"x1\""));
    }

    #[test]
    fn container_mode_uses_env_file_not_exports() {
        let mut t = task();
        t.env.push(("SAMPLE".into(), "x1".into()));
        t.container = Some("ubuntu:24.04".into());
        let text = build(&t);
        assert!(!text.contains("export SAMPLE"));
        assert!(text.contains("--env-file .command.env"));
        assert!(text.contains("ubuntu:24.04"));
    }

    #[test]
    fn staged_files_link_under_stored_names() {
        let mut t = task();
        t.staged
            .push(crate::staging::FileHolder::new("/data/in.fq", "file1.fq"));
        let text = build(&t);
        assert!(text.contains("ln -s \"/data/in.fq\" \"file1.fq\""));
    }

    #[test]
    fn shebang_scripts_run_through_code_file() {
        let mut t = task();
        let (shebang, body) = split_shebang("#!/usr/bin/env python3\nprint(6*7)\n");
        t.shebang = shebang;
        t.script = body;
        let text = build(&t);
        assert!(text.contains("/usr/bin/env python3 .command.code"));
        assert!(!text.contains("print(6*7)"));
    }

    #[test]
    fn stdin_redirects_from_command_in() {
        let mut t = task();
        t.stdin = Some("payload".into());
        assert!(build(&t).contains("< .command.in"));
    }
}
