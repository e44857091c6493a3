//! The interactive command interpreter.
//!
//! Reads whitespace-separated commands from its input (a `"..."` argument is
//! taken literally), dispatches them against a mounted [`FileSystem`], and
//! prints results to its output. Failures print the error message plus its
//! numeric code. `exit` (or end of input) leaves the loop; the caller owns
//! unmounting.

use std::io::{self, BufRead, Write};

use byte_unit::Byte;

use crate::error::FsResult;
use crate::fs::filesystem::FileSystem;
use crate::fs::inode::FileKind;
use crate::fs::BLOCK_SIZE;
use crate::utils::time_util;

pub struct Shell<'a> {
    fs: &'a FileSystem,
}

impl<'a> Shell<'a> {
    pub fn new(fs: &'a FileSystem) -> Self {
        Shell { fs }
    }

    /// Run the command loop until `exit` or end of input.
    pub fn run<R: BufRead, W: Write>(&self, input: &mut R, output: &mut W) -> io::Result<()> {
        loop {
            write!(output, "{} > ", self.fs.working_directory())?;
            output.flush()?;
            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                break;
            }
            let line = line.trim();
            if line == "exit" || line == "quit" {
                break;
            }
            self.handle_command(line, input, output)?;
        }
        Ok(())
    }

    fn handle_command<R: BufRead, W: Write>(
        &self,
        line: &str,
        input: &mut R,
        output: &mut W,
    ) -> io::Result<()> {
        let args = split_command(line);
        let Some(cmd) = args.first() else {
            return Ok(());
        };
        match cmd.as_str() {
            "cd" => self.cmd_cd(&args, output),
            "pwd" => writeln!(output, "{}", self.fs.working_directory()),
            "ls" => self.cmd_ls(&args, output),
            "stat" => self.cmd_stat(&args, output),
            "touch" => self.cmd_touch(&args, output),
            "cat" => self.cmd_cat(&args, output),
            "echo" => self.cmd_echo(&args, output),
            "rm" => self.cmd_rm(&args, output),
            "mkdir" => self.cmd_mkdir(&args, output),
            "rmdir" => self.cmd_rmdir(&args, output),
            "edit" => self.cmd_edit(&args, input, output),
            "open" => self.cmd_open(&args, output),
            "close" => self.cmd_close(&args, output),
            "df" => self.cmd_df(output),
            "cache" => self.cmd_cache(output),
            "fsck" => report(output, self.fs.verify()),
            "help" => cmd_help(output),
            other => {
                writeln!(output, "unknown command: {other}")?;
                writeln!(output, "type 'help' for the command list")
            }
        }
    }

    fn cmd_cd<W: Write>(&self, args: &[String], output: &mut W) -> io::Result<()> {
        let Some(path) = args.get(1) else {
            return writeln!(output, "usage: cd <path>");
        };
        report(output, self.fs.change_directory(path))
    }

    fn cmd_ls<W: Write>(&self, args: &[String], output: &mut W) -> io::Result<()> {
        let path = args.get(1).map(String::as_str).unwrap_or(".");
        match self.fs.list_directory(path) {
            Ok(entries) => {
                writeln!(output, "TYPE\tSIZE\tMODIFIED\t\tNAME")?;
                writeln!(output, "----------------------------------------")?;
                for entry in entries {
                    writeln!(
                        output,
                        "{}\t{}\t{}\t{}",
                        match entry.kind {
                            FileKind::Directory => "DIR",
                            FileKind::File => "FILE",
                        },
                        entry.size,
                        time_util::format_timestamp(entry.modify_time),
                        entry.name
                    )?;
                }
                Ok(())
            }
            Err(e) => report(output, Err(e)),
        }
    }

    fn cmd_stat<W: Write>(&self, args: &[String], output: &mut W) -> io::Result<()> {
        let Some(path) = args.get(1) else {
            return writeln!(output, "usage: stat <path>");
        };
        match self.fs.stat(path) {
            Ok(info) => {
                writeln!(
                    output,
                    "type: {}",
                    match info.kind {
                        FileKind::Directory => "directory",
                        FileKind::File => "file",
                    }
                )?;
                writeln!(output, "size: {} bytes", info.size)?;
                writeln!(
                    output,
                    "blocks: {} starting at {}",
                    info.block_count, info.start_block
                )?;
                writeln!(output, "inode: {}", info.inode_id)?;
                writeln!(output, "parent inode: {}", info.parent_id)?;
                writeln!(
                    output,
                    "created: {}",
                    time_util::format_timestamp(info.create_time)
                )?;
                writeln!(
                    output,
                    "modified: {}",
                    time_util::format_timestamp(info.modify_time)
                )
            }
            Err(e) => report(output, Err(e)),
        }
    }

    fn cmd_touch<W: Write>(&self, args: &[String], output: &mut W) -> io::Result<()> {
        let Some(path) = args.get(1) else {
            return writeln!(output, "usage: touch <path>");
        };
        report(output, self.fs.create_file(path, b"").map(|_| ()))
    }

    fn cmd_cat<W: Write>(&self, args: &[String], output: &mut W) -> io::Result<()> {
        let Some(path) = args.get(1) else {
            return writeln!(output, "usage: cat <path>");
        };
        match self.fs.read_file(path) {
            Ok(content) => writeln!(output, "{}", String::from_utf8_lossy(&content)),
            Err(e) => report(output, Err(e)),
        }
    }

    /// `echo <content>... > <path>`: everything before `>` is content, the
    /// token after it is the destination.
    fn cmd_echo<W: Write>(&self, args: &[String], output: &mut W) -> io::Result<()> {
        if args.len() < 3 || args[args.len() - 2] != ">" {
            return writeln!(output, "usage: echo <content> > <path>");
        }
        let content = args[1..args.len() - 2].join(" ");
        let path = &args[args.len() - 1];
        report(output, self.fs.write_file(path, content.as_bytes()))
    }

    fn cmd_rm<W: Write>(&self, args: &[String], output: &mut W) -> io::Result<()> {
        let Some(path) = args.get(1) else {
            return writeln!(output, "usage: rm <path>");
        };
        report(output, self.fs.delete_file(path))
    }

    fn cmd_mkdir<W: Write>(&self, args: &[String], output: &mut W) -> io::Result<()> {
        let Some(path) = args.get(1) else {
            return writeln!(output, "usage: mkdir <path>");
        };
        report(output, self.fs.create_directory(path).map(|_| ()))
    }

    fn cmd_rmdir<W: Write>(&self, args: &[String], output: &mut W) -> io::Result<()> {
        let Some(path) = args.get(1) else {
            return writeln!(output, "usage: rmdir <path>");
        };
        report(output, self.fs.delete_directory(path, false))
    }

    /// Print current content, then collect lines until a lone `.exit` and
    /// save them as the new content.
    fn cmd_edit<R: BufRead, W: Write>(
        &self,
        args: &[String],
        input: &mut R,
        output: &mut W,
    ) -> io::Result<()> {
        let Some(path) = args.get(1) else {
            return writeln!(output, "usage: edit <path>");
        };
        if let Ok(content) = self.fs.read_file(path) {
            if !content.is_empty() {
                writeln!(output, "{}", String::from_utf8_lossy(&content))?;
            }
        }
        writeln!(output, "editing, finish with a line reading '.exit':")?;
        let mut new_content = String::new();
        let mut line = String::new();
        loop {
            line.clear();
            if input.read_line(&mut line)? == 0 {
                break;
            }
            let line = line.trim_end_matches('\n');
            if line == ".exit" {
                break;
            }
            if !new_content.is_empty() {
                new_content.push('\n');
            }
            new_content.push_str(line);
        }
        report(output, self.fs.write_file(path, new_content.as_bytes()))
    }

    fn cmd_open<W: Write>(&self, args: &[String], output: &mut W) -> io::Result<()> {
        let Some(path) = args.get(1) else {
            return writeln!(output, "usage: open <path>");
        };
        report(output, self.fs.open(path))
    }

    fn cmd_close<W: Write>(&self, args: &[String], output: &mut W) -> io::Result<()> {
        let Some(path) = args.get(1) else {
            return writeln!(output, "usage: close <path>");
        };
        report(output, self.fs.close(path))
    }

    fn cmd_df<W: Write>(&self, output: &mut W) -> io::Result<()> {
        match self.fs.disk_usage() {
            Ok(usage) => {
                let bytes =
                    |blocks: u32| Byte::from_bytes(blocks as u128 * BLOCK_SIZE as u128);
                let percent =
                    usage.used_blocks as f64 / usage.total_blocks.max(1) as f64 * 100.0;
                writeln!(
                    output,
                    "total: {} ({} blocks)",
                    bytes(usage.total_blocks).get_appropriate_unit(true),
                    usage.total_blocks
                )?;
                writeln!(
                    output,
                    "used:  {} ({} blocks, {percent:.1}%, {} metadata)",
                    bytes(usage.used_blocks).get_appropriate_unit(true),
                    usage.used_blocks,
                    usage.metadata_blocks
                )?;
                writeln!(
                    output,
                    "free:  {} ({} blocks)",
                    bytes(usage.free_blocks).get_appropriate_unit(true),
                    usage.free_blocks
                )?;
                writeln!(
                    output,
                    "inodes: {} of {} in use",
                    usage.used_inodes, usage.inode_capacity
                )
            }
            Err(e) => report(output, Err(e)),
        }
    }

    fn cmd_cache<W: Write>(&self, output: &mut W) -> io::Result<()> {
        match self.fs.cache_status() {
            Ok(status) => {
                writeln!(
                    output,
                    "{} of {} frames in use",
                    status.resident.len(),
                    status.capacity
                )?;
                writeln!(output, "BLOCK\tSTATE")?;
                for frame in status.resident {
                    writeln!(
                        output,
                        "{}\t{}",
                        frame.block,
                        if frame.dirty { "dirty" } else { "clean" }
                    )?;
                }
                Ok(())
            }
            Err(e) => report(output, Err(e)),
        }
    }
}

fn report<W: Write>(output: &mut W, result: FsResult<()>) -> io::Result<()> {
    if let Err(e) = result {
        writeln!(output, "error {}: {e}", e.code())?;
    }
    Ok(())
}

fn cmd_help<W: Write>(output: &mut W) -> io::Result<()> {
    writeln!(output, "available commands:")?;
    writeln!(output, "  cd <path>              change the working directory")?;
    writeln!(output, "  pwd                    print the working directory")?;
    writeln!(output, "  ls [path]              list a directory")?;
    writeln!(output, "  stat <path>            show file or directory details")?;
    writeln!(output, "  touch <path>           create an empty file")?;
    writeln!(output, "  cat <path>             print a file")?;
    writeln!(output, "  echo <text>... > <path> write text into a file")?;
    writeln!(output, "  rm <path>              delete a file")?;
    writeln!(output, "  mkdir <path>           create a directory")?;
    writeln!(output, "  rmdir <path>           delete an empty directory")?;
    writeln!(output, "  edit <path>            edit a file, end with '.exit'")?;
    writeln!(output, "  open <path>            take an open reference")?;
    writeln!(output, "  close <path>           drop an open reference")?;
    writeln!(output, "  df                     show disk usage")?;
    writeln!(output, "  cache                  show block cache state")?;
    writeln!(output, "  fsck                   check filesystem consistency")?;
    writeln!(output, "  help                   show this help")?;
    writeln!(output, "  exit                   leave the shell")
}

/// Split a command line on spaces; `"..."` regions join into one argument.
pub fn split_command(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut arg = String::new();
    let mut in_quotes = false;
    for c in command.chars() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if c == ' ' && !in_quotes {
            if !arg.is_empty() {
                args.push(std::mem::take(&mut arg));
            }
        } else {
            arg.push(c);
        }
    }
    if !arg.is_empty() {
        args.push(arg);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mounted_fs() -> (tempfile::TempDir, FileSystem) {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileSystem::new();
        let image = dir.path().join("shell.img");
        fs.format(image.to_str().unwrap(), 8).unwrap();
        fs.mount(image.to_str().unwrap()).unwrap();
        (dir, fs)
    }

    fn run_session(fs: &FileSystem, script: &str) -> String {
        let mut input = io::Cursor::new(script.as_bytes().to_vec());
        let mut output = Vec::new();
        Shell::new(fs).run(&mut input, &mut output).unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn split_respects_quotes() {
        assert_eq!(split_command("ls /a"), vec!["ls", "/a"]);
        assert_eq!(
            split_command("echo \"two words\" > /f"),
            vec!["echo", "two words", ">", "/f"]
        );
        assert_eq!(split_command("   "), Vec::<String>::new());
        assert_eq!(split_command("a  b"), vec!["a", "b"]);
    }

    #[test]
    fn touch_echo_cat_stat_session() {
        let (_dir, fs) = mounted_fs();
        let out = run_session(
            &fs,
            "touch /a.txt\necho hello > /a.txt\ncat /a.txt\nstat /a.txt\nexit\n",
        );
        assert!(out.contains("hello"));
        assert!(out.contains("size: 5 bytes"));
        assert!(out.contains("type: file"));
        assert!(out.contains("blocks: 1"));
    }

    #[test]
    fn ls_shows_dot_entries() {
        let (_dir, fs) = mounted_fs();
        let out = run_session(&fs, "mkdir /d\nls /\nexit\n");
        assert!(out.contains("DIR"));
        assert!(out.contains("\t.\n"));
        assert!(out.contains("\t..\n"));
        assert!(out.contains("\td\n"));
    }

    #[test]
    fn cd_updates_the_prompt() {
        let (_dir, fs) = mounted_fs();
        let out = run_session(&fs, "mkdir /d1\ncd /d1\npwd\nexit\n");
        assert!(out.contains("/d1 > "));
        assert!(out.contains("/d1\n"));
    }

    #[test]
    fn errors_print_their_codes() {
        let (_dir, fs) = mounted_fs();
        let out = run_session(&fs, "cat /missing\nrm /missing\nexit\n");
        let code = crate::error::FsError::NotFound(String::new()).code();
        assert_eq!(out.matches(&format!("error {code}:")).count(), 2);
    }

    #[test]
    fn echo_without_redirect_prints_usage() {
        let (_dir, fs) = mounted_fs();
        let out = run_session(&fs, "echo just words\nexit\n");
        assert!(out.contains("usage: echo"));
    }

    #[test]
    fn quoted_echo_preserves_spaces() {
        let (_dir, fs) = mounted_fs();
        run_session(&fs, "echo \"alpha beta\" gamma > /q\nexit\n");
        assert_eq!(fs.read_file("/q").unwrap(), b"alpha beta gamma");
    }

    #[test]
    fn edit_collects_lines_until_exit_marker() {
        let (_dir, fs) = mounted_fs();
        run_session(&fs, "edit /note\nline one\nline two\n.exit\nexit\n");
        assert_eq!(fs.read_file("/note").unwrap(), b"line one\nline two");
    }

    #[test]
    fn open_close_drive_the_busy_policy() {
        let (_dir, fs) = mounted_fs();
        let out = run_session(
            &fs,
            "touch /b\nopen /b\nrm /b\nclose /b\nrm /b\nls /\nexit\n",
        );
        let busy = crate::error::FsError::Busy(String::new()).code();
        assert!(out.contains(&format!("error {busy}:")));
        assert!(!out.contains("\tb\n"));
    }

    #[test]
    fn df_and_cache_and_fsck_report() {
        let (_dir, fs) = mounted_fs();
        let out = run_session(&fs, "df\ncache\nfsck\nexit\n");
        assert!(out.contains("blocks"));
        assert!(out.contains("inodes: 1 of 1024 in use"));
        assert!(out.contains("frames in use"));
        // A healthy image passes fsck silently.
        assert!(!out.contains("error"));
    }

    #[test]
    fn unknown_commands_point_at_help() {
        let (_dir, fs) = mounted_fs();
        let out = run_session(&fs, "frobnicate\nexit\n");
        assert!(out.contains("unknown command: frobnicate"));
        let help = run_session(&fs, "help\nexit\n");
        assert!(help.contains("rmdir"));
        assert!(help.contains("fsck"));
    }

    #[test]
    fn eof_ends_the_session() {
        let (_dir, fs) = mounted_fs();
        let out = run_session(&fs, "pwd\n");
        assert!(out.ends_with("/ > "));
    }
}
