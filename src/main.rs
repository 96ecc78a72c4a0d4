use ext2_vdisk::fs::FsType;
use ext2_vdisk::partition::{Fit, PartKind, SizeUnit};
use ext2_vdisk::path::FsPath;
use ext2_vdisk::perm::Perm;
use ext2_vdisk::{Engine, EngineConfig};

use anyhow::{bail, Context};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "ext2-vdisk", version, about = "Simulated disks with an ext2/ext3-like filesystem")]
struct Cli {
    /// file of commands, one per line; stdin when absent
    #[arg(long)]
    script: Option<PathBuf>,

    #[arg(long, env = "VDISK_ID_PREFIX", default_value = "50")]
    id_prefix: String,

    #[arg(long, env = "VDISK_ROOT_PASSWORD", default_value = "123")]
    root_password: String,

    /// permission of new files and directories
    #[arg(long, default_value = "664")]
    default_perm: String,
}

/// One command line, e.g. `mkdisk -size=5 -unit=M -path=/tmp/a.mia`.
#[derive(Debug, Parser)]
#[command(no_binary_name = true)]
enum Line {
    Mkdisk {
        #[arg(long)]
        size: u64,
        #[arg(long, default_value = "M")]
        unit: String,
        #[arg(long, default_value = "FF")]
        fit: String,
        #[arg(long)]
        path: PathBuf,
    },
    Rmdisk {
        #[arg(long)]
        path: PathBuf,
    },
    Fdisk {
        #[arg(long)]
        size: Option<u64>,
        #[arg(long, default_value = "M")]
        unit: String,
        #[arg(long)]
        path: PathBuf,
        #[arg(long = "type", default_value = "P")]
        kind: String,
        #[arg(long, default_value = "FF")]
        fit: String,
        #[arg(long)]
        name: String,
        /// delete the named partition instead of creating it
        #[arg(long)]
        delete: Option<String>,
    },
    Mount {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        name: String,
    },
    Unmount {
        #[arg(long)]
        id: String,
    },
    Mounted,
    Mkfs {
        #[arg(long)]
        id: String,
        #[arg(long = "type", default_value = "full")]
        kind: String,
        #[arg(long, default_value = "2fs")]
        fs: String,
    },
    Login {
        #[arg(long)]
        user: String,
        #[arg(long)]
        pass: String,
        #[arg(long)]
        id: String,
    },
    Logout,
    Mkgrp {
        #[arg(long)]
        name: String,
    },
    Rmgrp {
        #[arg(long)]
        name: String,
    },
    Mkusr {
        #[arg(long)]
        user: String,
        #[arg(long)]
        pass: String,
        #[arg(long)]
        grp: String,
    },
    Rmusr {
        #[arg(long)]
        user: String,
    },
    Chgrp {
        #[arg(long)]
        user: String,
        #[arg(long)]
        grp: String,
    },
    Mkdir {
        #[arg(long)]
        path: String,
        #[arg(short = 'p')]
        parents: bool,
    },
    Mkfile {
        #[arg(long)]
        path: String,
        #[arg(short = 'r')]
        recursive: bool,
        #[arg(long)]
        size: Option<usize>,
        /// host file whose text becomes the content
        #[arg(long)]
        cont: Option<PathBuf>,
    },
    Cat {
        #[arg(long = "file", required = true)]
        files: Vec<String>,
    },
    Edit {
        #[arg(long)]
        path: String,
        /// host file whose text replaces the content
        #[arg(long, alias = "contenido")]
        cont: PathBuf,
    },
    Remove {
        #[arg(long)]
        path: String,
    },
    Rename {
        #[arg(long)]
        path: String,
        #[arg(long)]
        name: String,
    },
    Copy {
        #[arg(long)]
        path: String,
        #[arg(long, alias = "destino")]
        dest: String,
    },
    Find {
        #[arg(long)]
        path: String,
        #[arg(long)]
        name: String,
    },
    Chown {
        #[arg(long)]
        path: String,
        #[arg(short = 'r')]
        recursive: bool,
        #[arg(long, alias = "usuario")]
        user: String,
    },
    Chmod {
        #[arg(long)]
        path: String,
        #[arg(short = 'r')]
        recursive: bool,
        #[arg(long)]
        ugo: String,
    },
    Journaling {
        #[arg(long)]
        id: String,
    },
    Loss {
        #[arg(long)]
        id: String,
    },
    Recovery {
        #[arg(long)]
        id: String,
    },
    Tree {
        #[arg(long)]
        id: String,
    },
}

impl Line {
    fn needs_root(&self) -> bool {
        matches!(
            self,
            Line::Mkgrp { .. }
                | Line::Rmgrp { .. }
                | Line::Mkusr { .. }
                | Line::Rmusr { .. }
                | Line::Chgrp { .. }
        )
    }
}

/// Split on whitespace, keeping double-quoted runs together.
fn tokenize(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

/// `-key=value` becomes `--key=value` with a lowercase key, `-fileN` becomes
/// `--file`, and bare flags such as `-p` pass through.
fn normalize(tokens: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(tokens.len());
    for (i, tok) in tokens.into_iter().enumerate() {
        if i == 0 {
            out.push(tok.to_lowercase());
            continue;
        }
        let body = tok.trim_start_matches('-');
        match body.split_once('=') {
            Some((key, value)) => {
                let mut key = key.to_lowercase();
                if key.starts_with("file") && key[4..].chars().all(|c| c.is_ascii_digit()) {
                    key = "file".to_string();
                }
                out.push(format!("--{}={}", key, value));
            }
            None if body.len() == 1 => out.push(format!("-{}", body.to_lowercase())),
            None => out.push(format!("--{}", body.to_lowercase())),
        }
    }
    out
}

fn read_host(path: &PathBuf) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn fs_path(s: &str) -> anyhow::Result<FsPath> {
    Ok(FsPath::parse(s)?)
}

fn execute(engine: &mut Engine, line: Line) -> anyhow::Result<String> {
    if line.needs_root() && engine.session().map(|s| s.is_root()) != Some(true) {
        bail!("only root may administer users and groups");
    }
    let out = match line {
        Line::Mkdisk {
            size,
            unit,
            fit,
            path,
        } => {
            engine.mkdisk(&path, size, SizeUnit::parse(&unit)?, Fit::parse(&fit)?)?;
            format!("disk {} created", path.display())
        }
        Line::Rmdisk { path } => {
            engine.rmdisk(&path)?;
            format!("disk {} removed", path.display())
        }
        Line::Fdisk {
            size,
            unit,
            path,
            kind,
            fit,
            name,
            delete,
        } => {
            if delete.is_some() {
                let kind = engine.fdisk_delete(&path, &name)?;
                format!("{:?} partition {} deleted", kind, name)
            } else {
                let size = size.context("fdisk needs -size")?;
                let at = engine.fdisk(
                    &path,
                    &name,
                    size,
                    SizeUnit::parse(&unit)?,
                    PartKind::parse(&kind)?,
                    Fit::parse(&fit)?,
                )?;
                format!("{:?} partition {} at byte {} ({} bytes)", at.kind, name, at.start, at.size)
            }
        }
        Line::Mount { path, name } => {
            let id = engine.mount(&path, &name)?;
            format!("partition {} mounted as {}", name, id)
        }
        Line::Unmount { id } => {
            engine.unmount(&id)?;
            format!("{} unmounted", id)
        }
        Line::Mounted => engine
            .mounted()
            .iter()
            .map(|m| format!("{} {} {}", m.id, m.name, m.disk.display()))
            .collect::<Vec<_>>()
            .join("\n"),
        Line::Mkfs { id, kind, fs } => {
            if !kind.eq_ignore_ascii_case("full") {
                bail!("mkfs only supports -type=full");
            }
            let fs_type = FsType::parse(&fs)?;
            engine.mkfs(&id, fs_type)?;
            format!("{} formatted as {:?}", id, fs_type)
        }
        Line::Login { user, pass, id } => {
            engine.login(&user, &pass, &id)?;
            format!("welcome {}", user)
        }
        Line::Logout => format!("bye {}", engine.logout()?),
        Line::Mkgrp { name } => format!("group {} has id {}", name, engine.mkgrp(&name)?),
        Line::Rmgrp { name } => {
            engine.rmgrp(&name)?;
            format!("group {} removed", name)
        }
        Line::Mkusr { user, pass, grp } => {
            format!("user {} has id {}", user, engine.mkusr(&user, &pass, &grp)?)
        }
        Line::Rmusr { user } => {
            engine.rmusr(&user)?;
            format!("user {} removed", user)
        }
        Line::Chgrp { user, grp } => {
            engine.chgrp(&user, &grp)?;
            format!("user {} moved to {}", user, grp)
        }
        Line::Mkdir { path, parents } => {
            engine.mkdir(&fs_path(&path)?, parents)?;
            format!("directory {} created", path)
        }
        Line::Mkfile {
            path,
            recursive,
            size,
            cont,
        } => {
            let content = cont.as_ref().map(read_host).transpose()?;
            engine.mkfile(&fs_path(&path)?, recursive, size, content.as_deref())?;
            format!("file {} created", path)
        }
        Line::Cat { files } => {
            let paths = files
                .iter()
                .map(|f| fs_path(f))
                .collect::<anyhow::Result<Vec<_>>>()?;
            engine.cat(&paths)?
        }
        Line::Edit { path, cont } => {
            engine.edit(&fs_path(&path)?, &read_host(&cont)?)?;
            format!("file {} edited", path)
        }
        Line::Remove { path } => {
            engine.remove(&fs_path(&path)?)?;
            format!("{} removed", path)
        }
        Line::Rename { path, name } => {
            engine.rename(&fs_path(&path)?, &name)?;
            format!("{} renamed to {}", path, name)
        }
        Line::Copy { path, dest } => {
            engine.copy(&fs_path(&path)?, &fs_path(&dest)?)?;
            format!("{} copied into {}", path, dest)
        }
        Line::Find { path, name } => engine.find(&fs_path(&path)?, &name)?.join("\n"),
        Line::Chown {
            path,
            recursive,
            user,
        } => {
            engine.chown(&fs_path(&path)?, recursive, &user)?;
            format!("{} now owned by {}", path, user)
        }
        Line::Chmod {
            path,
            recursive,
            ugo,
        } => {
            let perm = Perm::parse(&ugo)?;
            engine.chmod(&fs_path(&path)?, recursive, perm)?;
            format!("{} set to {}", path, perm)
        }
        Line::Journaling { id } => serde_json::to_string_pretty(&engine.journaling(&id)?)?,
        Line::Loss { id } => {
            engine.loss(&id)?;
            format!("{} lost", id)
        }
        Line::Recovery { id } => {
            engine.recovery(&id)?;
            format!("{} recovered", id)
        }
        Line::Tree { id } => serde_json::to_string_pretty(&engine.tree(&id)?)?,
    };
    Ok(out)
}

fn run_line(engine: &mut Engine, raw: &str) -> anyhow::Result<Option<String>> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('#') {
        return Ok(None);
    }
    let line = Line::try_parse_from(normalize(tokenize(raw)))?;
    log::debug!("{:?}", line);
    execute(engine, line).map(Some)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = EngineConfig {
        id_prefix: cli.id_prefix,
        default_perm: Perm::parse(&cli.default_perm)?,
        root_password: cli.root_password,
    };
    let mut engine = Engine::new(config)?;

    let input: Box<dyn BufRead> = match &cli.script {
        Some(path) => Box::new(io::BufReader::new(
            std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(io::stdin().lock()),
    };
    let interactive = cli.script.is_none();
    let mut stdout = io::stdout();
    if interactive {
        print!("> ");
        stdout.flush()?;
    }
    for line in input.lines() {
        let line = line?;
        match run_line(&mut engine, &line) {
            Ok(Some(out)) if !out.is_empty() => println!("{}", out),
            Ok(_) => {}
            Err(e) => eprintln!("error: {:#}", e),
        }
        if interactive {
            print!("> ");
            stdout.flush()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_keeps_quotes() {
        assert_eq!(
            tokenize(r#"mkdir -path="/home/my docs"  -p"#),
            ["mkdir", "-path=/home/my docs", "-p"]
        );
    }

    #[test]
    fn normalize_flags() {
        let toks = normalize(tokenize("CAT -file1=/a -File2=/b"));
        assert_eq!(toks, ["cat", "--file=/a", "--file=/b"]);
        let toks = normalize(tokenize("mkfile -r -size=10 -Path=/x"));
        assert_eq!(toks, ["mkfile", "-r", "--size=10", "--path=/x"]);
    }

    #[test]
    fn lines_parse() {
        let line = Line::try_parse_from(normalize(tokenize(
            "fdisk -size=300 -path=/tmp/a.mia -name=p1 -type=E",
        )))
        .unwrap();
        match line {
            Line::Fdisk {
                size, kind, fit, unit, ..
            } => {
                assert_eq!(size, Some(300));
                assert_eq!(kind, "E");
                assert_eq!(fit, "FF");
                assert_eq!(unit, "M");
            }
            other => panic!("unexpected {:?}", other),
        }
        let line = Line::try_parse_from(normalize(tokenize("cat -file1=/a -file2=/b"))).unwrap();
        assert!(matches!(line, Line::Cat { files } if files.len() == 2));
        assert!(Line::try_parse_from(normalize(tokenize("mkdisk -path=/x"))).is_err());
        assert!(Line::try_parse_from(normalize(tokenize("bogus"))).is_err());
    }

    #[test]
    fn admin_needs_root() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let err = run_line(&mut engine, "mkgrp -name=devs").unwrap_err();
        assert!(err.to_string().contains("root"));
        assert_eq!(run_line(&mut engine, "# comment").unwrap(), None);
    }
}
