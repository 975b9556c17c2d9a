//! Repository discovery and handles.
//!
//! Resolves the repository directory (explicit path, `GIT_DIR`, a
//! worktree's `.git` directory, or a `.git` *file* pointing elsewhere),
//! honors `commondir` for linked worktrees, and hands out the object
//! database and ref store rooted there. `init` lays down the canonical
//! skeleton:
//!
//! ```text
//! HEAD              ref: refs/heads/master
//! config
//! objects/{info,pack}
//! refs/{heads,tags}
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::env::Environment;
use crate::object::id::ObjectFormat;
use crate::odb::store::ObjectDatabase;
use crate::odb::OdbError;
use crate::refs::store::RefStore;

/// Errors from repository discovery and creation.
#[derive(Debug)]
#[non_exhaustive]
pub enum RepoError {
    /// No repository at or above the given path.
    NotFound { start: PathBuf },
    /// A `.git` file or `commondir` indirection is malformed.
    BadGitFile { detail: String },
    /// Object database failed to open.
    Odb(OdbError),
    /// Filesystem failure.
    Io(io::Error),
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { start } => {
                write!(f, "no git repository found from {}", start.display())
            }
            Self::BadGitFile { detail } => write!(f, "bad gitdir indirection: {detail}"),
            Self::Odb(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "repository I/O error: {err}"),
        }
    }
}

impl std::error::Error for RepoError {}

impl From<io::Error> for RepoError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<OdbError> for RepoError {
    fn from(err: OdbError) -> Self {
        Self::Odb(err)
    }
}

/// An opened repository.
pub struct Repository {
    git_dir: PathBuf,
    common_dir: PathBuf,
    odb: ObjectDatabase,
    refs: RefStore,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("git_dir", &self.git_dir)
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Opens the repository at `path`: a worktree containing `.git`
    /// (directory or file), or a git directory itself.
    pub fn open(path: &Path) -> Result<Self, RepoError> {
        let git_dir = resolve_git_dir(path)?;
        Self::open_git_dir(&git_dir)
    }

    /// Discovers a repository: `GIT_DIR` from `env` when set, else
    /// walking up from `start`.
    pub fn discover(start: &Path, env: &Environment) -> Result<Self, RepoError> {
        if let Some(dir) = env.var("GIT_DIR") {
            return Self::open_git_dir(Path::new(&dir));
        }
        let mut cursor = Some(start.to_owned());
        while let Some(dir) = cursor {
            if let Ok(git_dir) = resolve_git_dir(&dir) {
                return Self::open_git_dir(&git_dir);
            }
            cursor = dir.parent().map(Path::to_owned);
        }
        Err(RepoError::NotFound {
            start: start.to_owned(),
        })
    }

    /// Opens an explicit git directory.
    pub fn open_git_dir(git_dir: &Path) -> Result<Self, RepoError> {
        if !git_dir.join("objects").is_dir() {
            return Err(RepoError::NotFound {
                start: git_dir.to_owned(),
            });
        }
        // Linked worktrees keep shared state under `commondir`.
        let common_dir = match fs::read_to_string(git_dir.join("commondir")) {
            Ok(text) => {
                let target = text.trim();
                if target.is_empty() {
                    return Err(RepoError::BadGitFile {
                        detail: "empty commondir".to_owned(),
                    });
                }
                let path = Path::new(target);
                if path.is_absolute() {
                    path.to_owned()
                } else {
                    git_dir.join(path)
                }
            }
            Err(_) => git_dir.to_owned(),
        };

        let odb = ObjectDatabase::open(&common_dir.join("objects"), ObjectFormat::Sha1)?;
        let refs = RefStore::new(&common_dir);
        Ok(Self {
            git_dir: git_dir.to_owned(),
            common_dir,
            odb,
            refs,
        })
    }

    /// Creates a repository skeleton and opens it.
    ///
    /// `bare` repositories use `path` as the git directory; otherwise
    /// `path/.git` is created.
    pub fn init(path: &Path, bare: bool) -> Result<Self, RepoError> {
        let git_dir = if bare {
            path.to_owned()
        } else {
            path.join(".git")
        };
        fs::create_dir_all(git_dir.join("objects").join("info"))?;
        fs::create_dir_all(git_dir.join("objects").join("pack"))?;
        fs::create_dir_all(git_dir.join("refs").join("heads"))?;
        fs::create_dir_all(git_dir.join("refs").join("tags"))?;

        let head = git_dir.join("HEAD");
        if !head.exists() {
            fs::write(&head, "ref: refs/heads/master\n")?;
        }
        let config = git_dir.join("config");
        if !config.exists() {
            let body = format!(
                "[core]\n\trepositoryformatversion = 0\n\tbare = {}\n",
                if bare { "true" } else { "false" }
            );
            fs::write(&config, body)?;
        }
        Self::open_git_dir(&git_dir)
    }

    /// The repository directory.
    #[must_use]
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// The shared directory (differs from `git_dir` in linked worktrees).
    #[must_use]
    pub fn common_dir(&self) -> &Path {
        &self.common_dir
    }

    /// The object database.
    #[must_use]
    pub fn odb(&self) -> &ObjectDatabase {
        &self.odb
    }

    /// The ref store.
    #[must_use]
    pub fn refs(&self) -> &RefStore {
        &self.refs
    }

    /// Loads `objects/info/commit-graph` when present, for
    /// generation-aware revision walks. A corrupt graph file is treated
    /// as absent: it only accelerates ordering, it is not authoritative.
    #[must_use]
    pub fn commit_graph(&self) -> Option<crate::revwalk::graph::CommitGraphFile> {
        let info_dir = self.common_dir.join("objects").join("info");
        crate::revwalk::graph::CommitGraphFile::open(&info_dir, ObjectFormat::Sha1)
            .ok()
            .flatten()
    }
}

/// Resolves `path` to a git directory: itself, its `.git` directory, or
/// the target of its `.git` file.
fn resolve_git_dir(path: &Path) -> Result<PathBuf, RepoError> {
    let dotgit = path.join(".git");
    if dotgit.is_dir() {
        return Ok(dotgit);
    }
    if dotgit.is_file() {
        let text = fs::read_to_string(&dotgit)?;
        let target = text
            .strip_prefix("gitdir:")
            .map(str::trim)
            .ok_or_else(|| RepoError::BadGitFile {
                detail: format!("{} lacks gitdir pointer", dotgit.display()),
            })?;
        if target.is_empty() {
            return Err(RepoError::BadGitFile {
                detail: "empty gitdir pointer".to_owned(),
            });
        }
        let target_path = Path::new(target);
        let resolved = if target_path.is_absolute() {
            target_path.to_owned()
        } else {
            path.join(target_path)
        };
        if !resolved.is_dir() {
            return Err(RepoError::BadGitFile {
                detail: format!("gitdir target {} is not a directory", resolved.display()),
            });
        }
        return Ok(resolved);
    }
    if path.join("objects").is_dir() && path.join("HEAD").is_file() {
        return Ok(path.to_owned());
    }
    Err(RepoError::NotFound {
        start: path.to_owned(),
    })
}
