//! `sys:`, kernel objects exposed as readable text files: per-CPU clock
//! statistics, memory counters and per-process status.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;

use cairn_abi::io::{FileKind, PollEvents, Stat};
use cairn_abi::process::Pid;
use cairn_utils::path::PathBuf;
use core::fmt::Write;
use core::sync::atomic::Ordering;

use crate::fs::node::{Node, NodeBackend, NodeFs};
use crate::fs::{File, FileOps, FileRef, Filesystem, FsError, FsResult, PollReady, Volume};
use crate::memory::frame_allocator;

type Render = Box<dyn Fn() -> String + Send + Sync>;

/// A file whose content is generated fresh on every read.
struct RenderOps {
    render: Arc<Render>,
}

impl FileOps for RenderOps {
    fn read(&self, file: &File, buf: &mut [u8]) -> FsResult<usize> {
        let position = file.position();
        let count = self.read_at(file, position, buf)?;
        file.set_position(position + count as u64);
        Ok(count)
    }

    fn read_at(&self, _file: &File, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let content = (self.render)();
        let bytes = content.as_bytes();
        let offset = offset as usize;
        if offset >= bytes.len() {
            return Ok(0);
        }
        let count = buf.len().min(bytes.len() - offset);
        buf[..count].copy_from_slice(&bytes[offset..offset + count]);
        Ok(count)
    }

    fn len(&self, _file: &File) -> FsResult<usize> {
        Ok((self.render)().len())
    }

    fn poll(&self, _file: &File, _requested: PollEvents) -> FsResult<PollReady> {
        Ok(PollReady {
            ready: PollEvents::READ,
            queue: None,
        })
    }
}

struct RenderBackend {
    render: Arc<Render>,
}

impl RenderBackend {
    fn new(render: impl Fn() -> String + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            render: Arc::new(Box::new(render)),
        })
    }
}

impl NodeBackend for RenderBackend {
    fn open(&self, volume: &Arc<Volume>, _path: &PathBuf) -> FsResult<FileRef> {
        Ok(File::new(
            Some(volume.clone()),
            Box::new(RenderOps {
                render: self.render.clone(),
            }),
        ))
    }

    fn kind(&self) -> FileKind {
        FileKind::File
    }

    fn size(&self) -> usize {
        (self.render)().len()
    }
}

fn render_cpu_stats() -> String {
    let mut out = String::new();
    writeln!(out, "cpu idle_clocks active_clocks trap_clocks").ok();
    for cpu in crate::smp::cpus() {
        writeln!(
            out,
            "{} {} {} {}",
            cpu.id,
            cpu.stats.idle_clocks.load(Ordering::Relaxed),
            cpu.stats.active_clocks.load(Ordering::Relaxed),
            cpu.stats.trap_clocks.load(Ordering::Relaxed),
        )
        .ok();
    }
    out
}

fn render_mem_stats() -> String {
    let mut out = String::new();
    writeln!(out, "usable_frames {}", frame_allocator::usable_frames()).ok();
    writeln!(out, "free_frames {}", frame_allocator::free_frames()).ok();
    writeln!(out, "mapped_frames {}", frame_allocator::mapped_frames()).ok();
    out
}

/// The static part of `sys:` plus dynamic `proc/<pid>` resolution.
pub struct SysFs {
    nodes: NodeFs,
}

impl SysFs {
    fn proc_component(path: &PathBuf) -> Option<(Pid, Option<&str>)> {
        let mut names = path.parts().iter();
        if names.next()? != "proc" {
            return None;
        }
        let pid: Pid = names.next()?.parse().ok()?;
        let tail = names.next();
        Some((pid, tail))
    }
}

impl Filesystem for SysFs {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn open(&self, volume: &Arc<Volume>, path: &PathBuf) -> FsResult<FileRef> {
        if let Some((pid, tail)) = Self::proc_component(path) {
            return match tail {
                None => Err(FsError::IsADirectory),
                Some("status") => {
                    crate::sched::process::status_text(pid).ok_or(FsError::NotFound)?;
                    let backend = RenderBackend::new(move || {
                        crate::sched::process::status_text(pid)
                            .unwrap_or_else(|| String::from("gone\n"))
                    });
                    backend.open(volume, path)
                }
                Some("argv") => {
                    let process = crate::sched::process::find(pid).ok_or(FsError::NotFound)?;
                    let backend = RenderBackend::new(move || {
                        let mut out = String::new();
                        for arg in process.argv() {
                            writeln!(out, "{arg}").ok();
                        }
                        out
                    });
                    backend.open(volume, path)
                }
                Some(_) => Err(FsError::NotFound),
            };
        }
        self.nodes.open(volume, path)
    }

    fn stat(&self, path: &PathBuf) -> FsResult<Stat> {
        if let Some((pid, tail)) = Self::proc_component(path) {
            let known = crate::sched::process::status_text(pid).is_some();
            if !known {
                return Err(FsError::NotFound);
            }
            return Ok(match tail {
                None => Stat::new(0, FileKind::Directory),
                Some("status") | Some("argv") => Stat::new(0, FileKind::File),
                Some(_) => return Err(FsError::NotFound),
            });
        }
        self.nodes.stat(path)
    }
}

pub fn create() -> SysFs {
    let nodes = NodeFs::new("sysfs");
    let root = nodes.root().clone();

    let stat = root.insert(Node::new_dir("stat")).unwrap();
    stat.insert(Node::new_leaf("cpu", RenderBackend::new(render_cpu_stats)))
        .unwrap();
    stat.insert(Node::new_leaf("mem", RenderBackend::new(render_mem_stats)))
        .unwrap();

    root.insert(Node::new_dir("proc")).unwrap();

    SysFs { nodes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::VFS;
    use cairn_utils::make_path;

    #[test_case]
    fn cpu_stats_render_one_line_per_cpu() {
        let file = VFS.open(&make_path!("sys", "stat/cpu")).unwrap();
        let mut buf = [0u8; 1024];
        let count = file.read(&mut buf).unwrap();
        let text = core::str::from_utf8(&buf[..count]).unwrap();

        // header + one line per CPU
        assert_eq!(text.lines().count(), 1 + crate::smp::cpu_count());
        assert!(text.starts_with("cpu idle_clocks active_clocks trap_clocks"));
    }

    #[test_case]
    fn proc_status_for_the_kernel_process() {
        let file = VFS.open(&make_path!("sys", "proc/0/status")).unwrap();
        let mut buf = [0u8; 256];
        let count = file.read(&mut buf).unwrap();
        let text = core::str::from_utf8(&buf[..count]).unwrap();
        assert!(text.contains("pid 0"));
        assert!(text.contains("state alive"));
    }

    #[test_case]
    fn unknown_pid_is_not_found() {
        assert_eq!(
            VFS.stat(&make_path!("sys", "proc/99999/status")).unwrap_err(),
            FsError::NotFound
        );
    }
}
