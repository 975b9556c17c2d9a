//! In-process `file://` transport.
//!
//! Each opened direction spawns a server thread running the real
//! upload-pack or receive-pack engine against the target repository,
//! connected to the caller through in-process pipes. This is the
//! reference transport: everything the protocol engine does over a
//! network carrier it does here with zero substitutions.

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use crate::monitor::NullMonitor;
use crate::object::id::ObjectId;
use crate::object::ident::PersonIdent;
use crate::object::kind::ObjectKind;
use crate::object::tag::Tag;
use crate::odb::store::ObjectDatabase;
use crate::odb::traits::ObjectReader;
use crate::protocol::receive::{serve_receive_pack, AllowAll};
use crate::protocol::upload::serve_upload_pack;
use crate::refs::store::RefStore;
use crate::wire::pktline::{PktReader, PktWriter};

use super::pipe::{pipe, PipeReader, PipeWriter};
use super::{BidiStream, Transport, TransportError};

/// Transport against a repository on the local filesystem.
pub struct LocalTransport {
    repo_path: PathBuf,
    servers: Vec<JoinHandle<()>>,
    closed: bool,
}

impl LocalTransport {
    /// Transport for the repository at `repo_path` (worktree or bare).
    #[must_use]
    pub fn new(repo_path: &Path) -> Self {
        Self {
            repo_path: repo_path.to_owned(),
            servers: Vec::new(),
            closed: false,
        }
    }

    fn git_dir(&self) -> Result<PathBuf, TransportError> {
        let dotgit = self.repo_path.join(".git");
        if dotgit.is_dir() {
            return Ok(dotgit);
        }
        if self.repo_path.join("objects").is_dir() {
            return Ok(self.repo_path.clone());
        }
        Err(TransportError::NotARepository {
            detail: self.repo_path.display().to_string(),
        })
    }

    fn spawn_server(
        &mut self,
        git_dir: PathBuf,
        service: Service,
    ) -> Result<BidiStream, TransportError> {
        if self.closed {
            return Err(TransportError::Io(std::io::Error::other(
                "transport closed",
            )));
        }
        let (client_in, server_out) = pipe();
        let (server_in, client_out) = pipe();

        let handle = std::thread::Builder::new()
            .name(format!("gitwire-{}", service.name()))
            .spawn(move || serve(git_dir, service, server_in, server_out))
            .map_err(TransportError::Io)?;
        self.servers.push(handle);

        Ok(BidiStream {
            input: Box::new(client_in),
            output: Box::new(client_out),
        })
    }
}

impl Transport for LocalTransport {
    fn open_fetch(&mut self) -> Result<BidiStream, TransportError> {
        let git_dir = self.git_dir()?;
        self.spawn_server(git_dir, Service::UploadPack)
    }

    fn open_push(&mut self) -> Result<BidiStream, TransportError> {
        let git_dir = self.git_dir()?;
        self.spawn_server(git_dir, Service::ReceivePack)
    }

    fn close(&mut self) {
        self.closed = true;
        for handle in self.servers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Clone, Copy)]
enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    fn name(self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }
}

/// Server half: protocol errors end the conversation by closing the
/// pipes, which the client observes as a truncated stream.
fn serve(git_dir: PathBuf, service: Service, input: PipeReader, output: PipeWriter) {
    let Ok(db) = ObjectDatabase::open(&git_dir.join("objects"), Default::default()) else {
        return;
    };
    let refs = RefStore::new(&git_dir);
    let mut pkt_in = PktReader::new(input);
    let mut pkt_out = PktWriter::new(output);
    let mut monitor = NullMonitor;

    match service {
        Service::UploadPack => {
            let Ok((advertised, peeled)) = advertised_refs(&db, &refs) else {
                return;
            };
            let mut session = db.reader();
            let _ = serve_upload_pack(
                &mut pkt_in,
                &mut pkt_out,
                &advertised,
                &peeled,
                &mut session,
                &mut monitor,
            );
        }
        Service::ReceivePack => {
            let who = PersonIdent::new(
                "gitwire",
                "gitwire@localhost",
                crate::env::Environment::system().now_epoch_seconds(),
                0,
            );
            let _ = serve_receive_pack(
                &mut pkt_in,
                &mut pkt_out,
                &db,
                &refs,
                &who,
                &mut AllowAll,
                &mut monitor,
            );
        }
    }
}

/// Resolves the advertisement: `HEAD` first when born, then all refs in
/// name order, with peeled values for annotated tags.
pub(crate) fn advertised_refs(
    db: &ObjectDatabase,
    refs: &RefStore,
) -> Result<(Vec<(String, ObjectId)>, Vec<(String, ObjectId)>), TransportError> {
    let mut advertised = Vec::new();
    let mut peeled = Vec::new();

    let map_err = |detail: String| TransportError::NotARepository { detail };

    if let Ok(Some(resolved)) = refs.resolve("HEAD") {
        if let Some(id) = resolved.id {
            advertised.push(("HEAD".to_owned(), id));
        }
    }
    let listed = refs
        .list("refs/")
        .map_err(|err| map_err(err.to_string()))?;
    let mut session = db.reader();
    for found in listed {
        let Some(id) = found.target.id() else { continue };
        advertised.push((found.name.clone(), id));

        // Annotated tags advertise their peeled target too.
        if let Ok(data) = session.read(&id) {
            if data.kind == ObjectKind::Tag {
                if let Ok(tag) = Tag::parse(&data.bytes, id.format()) {
                    let mut terminal = tag.object;
                    let mut guard = 0;
                    while guard < 8 {
                        match session.read(&terminal) {
                            Ok(inner) if inner.kind == ObjectKind::Tag => {
                                match Tag::parse(&inner.bytes, terminal.format()) {
                                    Ok(inner_tag) => terminal = inner_tag.object,
                                    Err(_) => break,
                                }
                            }
                            _ => break,
                        }
                        guard += 1;
                    }
                    peeled.push((found.name, terminal));
                }
            }
        }
    }
    Ok((advertised, peeled))
}
