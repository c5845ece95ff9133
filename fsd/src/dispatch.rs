use common::protocol::{OpenFlags, Request, Response, Status, WireFile};
use libfilestore::{ClientId, LockOutcome, RemovedFile, StorageTable, StoreError};
use log::{debug, error};

use crate::notifier::Notifier;

pub fn status_of(err: &StoreError) -> Status {
    match err {
        StoreError::NotFound(_) => Status::NotFound,
        StoreError::PermissionDenied { .. } => Status::PermissionDenied,
        StoreError::AlreadyExists(_) => Status::AlreadyExists,
        StoreError::CapacityExceeded(_) => Status::CapacityExceeded,
        StoreError::TooLarge { .. } => Status::TooLarge,
        StoreError::NotOpen { .. } => Status::NotOpen,
        StoreError::NotHolder { .. } => Status::NotHolder,
        StoreError::InvalidArgument(_) => Status::InvalidArgument,
        StoreError::LockPoisoned(_) => Status::Internal,
    }
}

/// Runs one request for `client`. `None` means the reply is deferred: the
/// client queued for a lock and will be answered through the notifier.
pub fn dispatch(
    store: &StorageTable,
    notifier: &Notifier,
    client: ClientId,
    request: Request,
) -> Option<Response> {
    let op = request.op_name();
    match handle(store, notifier, client, request) {
        Ok(reply) => reply,
        Err(e) => {
            if let StoreError::TooLarge {
                pathname, waiters, ..
            } = &e
            {
                notifier.file_gone(pathname, waiters);
            }
            if let StoreError::LockPoisoned(_) = e {
                error!("{op} from {client} failed: {e}");
            } else {
                debug!("{op} from {client} failed: {e}");
            }
            Some(Response::error(status_of(&e), e.to_string()))
        }
    }
}

fn handle(
    store: &StorageTable,
    notifier: &Notifier,
    client: ClientId,
    request: Request,
) -> libfilestore::Result<Option<Response>> {
    match request {
        Request::OpenFile { pathname, flags } => {
            let lock = flags.contains(OpenFlags::LOCK);
            if flags.contains(OpenFlags::CREATE) {
                store.stage_create(&pathname, client, lock)?;
                return Ok(Some(Response::Ok));
            }
            store.open(&pathname, client)?;
            if lock {
                return lock_reply(store, &pathname, client);
            }
            Ok(Some(Response::Ok))
        }
        Request::ReadFile { pathname } => {
            let content = store.read(&pathname, client)?;
            Ok(Some(Response::Data(content)))
        }
        Request::ReadNFiles { n } => {
            let files = store
                .read_sample(n, client)?
                .into_iter()
                .map(|s| WireFile {
                    pathname: s.pathname,
                    content: s.content,
                })
                .collect();
            Ok(Some(Response::Files(files)))
        }
        Request::WriteFile { pathname, data } => {
            let evicted = store.write(&pathname, client, &data)?;
            Ok(Some(evicted_reply(notifier, evicted)))
        }
        Request::AppendToFile { pathname, data } => {
            let evicted = store.append(&pathname, client, &data)?;
            Ok(Some(evicted_reply(notifier, evicted)))
        }
        Request::LockFile { pathname } => lock_reply(store, &pathname, client),
        Request::UnlockFile { pathname } => {
            if let Some(next) = store.unlock(&pathname, client)? {
                notifier.grant(&pathname, next);
            }
            Ok(Some(Response::Ok))
        }
        Request::CloseFile { pathname } => {
            if let Some(next) = store.close(&pathname, client)? {
                notifier.grant(&pathname, next);
            }
            Ok(Some(Response::Ok))
        }
        Request::RemoveFile { pathname } => {
            let removed = store.remove(&pathname, client)?;
            notifier.file_gone(&removed.pathname, &removed.waiters);
            Ok(Some(Response::Ok))
        }
    }
}

fn lock_reply(
    store: &StorageTable,
    pathname: &str,
    client: ClientId,
) -> libfilestore::Result<Option<Response>> {
    match store.lock(pathname, client)? {
        LockOutcome::Acquired => Ok(Some(Response::Ok)),
        LockOutcome::Queued => Ok(None),
        LockOutcome::AlreadyRequested => {
            if store.status(pathname)?.lock_holder == Some(client) {
                Ok(Some(Response::Ok))
            } else {
                Ok(Some(Response::error(
                    Status::AlreadyRequested,
                    format!("{pathname}: lock already requested by {client}"),
                )))
            }
        }
    }
}

fn evicted_reply(notifier: &Notifier, evicted: Vec<RemovedFile>) -> Response {
    if evicted.is_empty() {
        return Response::Ok;
    }
    let files = evicted
        .into_iter()
        .map(|f| {
            notifier.file_gone(&f.pathname, &f.waiters);
            WireFile {
                pathname: f.pathname,
                content: f.content,
            }
        })
        .collect();
    Response::Evicted(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use libfilestore::StoreConfig;

    const C1: ClientId = ClientId(1);
    const C2: ClientId = ClientId(2);

    fn store(max_files: usize, max_bytes: u64) -> StorageTable {
        StorageTable::new(StoreConfig {
            max_files,
            max_bytes,
            ..Default::default()
        })
        .unwrap()
    }

    fn open(pathname: &str, flags: OpenFlags) -> Request {
        Request::OpenFile {
            pathname: pathname.to_string(),
            flags,
        }
    }

    #[tokio::test]
    async fn test_queued_lock_is_answered_on_unlock() {
        let store = store(4, 1024);
        let notifier = Notifier::new();
        let mut rx2 = notifier.register(C2);

        let create = open("/f", OpenFlags::CREATE | OpenFlags::LOCK);
        assert_eq!(dispatch(&store, &notifier, C1, create), Some(Response::Ok));
        let write = Request::WriteFile {
            pathname: "/f".into(),
            data: b"hi".to_vec(),
        };
        assert_eq!(dispatch(&store, &notifier, C1, write), Some(Response::Ok));

        // open + lock while c1 holds the lock: no reply yet
        assert_eq!(dispatch(&store, &notifier, C2, open("/f", OpenFlags::LOCK)), None);
        assert!(rx2.try_recv().is_err());

        let unlock = Request::UnlockFile { pathname: "/f".into() };
        assert_eq!(dispatch(&store, &notifier, C1, unlock), Some(Response::Ok));
        assert_eq!(rx2.recv().await, Some(Response::Ok));
    }

    #[tokio::test]
    async fn test_waiter_learns_of_eviction() {
        let store = store(1, 1024);
        let notifier = Notifier::new();
        let mut rx2 = notifier.register(C2);

        dispatch(&store, &notifier, C1, open("/a", OpenFlags::CREATE | OpenFlags::LOCK));
        dispatch(
            &store,
            &notifier,
            C1,
            Request::WriteFile {
                pathname: "/a".into(),
                data: b"a".to_vec(),
            },
        );
        assert_eq!(dispatch(&store, &notifier, C2, open("/a", OpenFlags::LOCK)), None);

        dispatch(&store, &notifier, C1, open("/b", OpenFlags::CREATE | OpenFlags::LOCK));
        let reply = dispatch(
            &store,
            &notifier,
            C1,
            Request::WriteFile {
                pathname: "/b".into(),
                data: b"b".to_vec(),
            },
        );
        assert_eq!(
            reply,
            Some(Response::Evicted(vec![WireFile {
                pathname: "/a".into(),
                content: b"a".to_vec(),
            }]))
        );
        assert!(matches!(
            rx2.recv().await,
            Some(Response::Error {
                status: Status::NotFound,
                ..
            })
        ));
    }

    #[test]
    fn test_errors_carry_status() {
        let store = store(4, 8);
        let notifier = Notifier::new();
        let reply = dispatch(&store, &notifier, C1, Request::ReadFile { pathname: "/x".into() });
        assert!(matches!(
            reply,
            Some(Response::Error {
                status: Status::NotFound,
                ..
            })
        ));

        dispatch(&store, &notifier, C1, open("/big", OpenFlags::CREATE | OpenFlags::LOCK));
        let reply = dispatch(
            &store,
            &notifier,
            C1,
            Request::WriteFile {
                pathname: "/big".into(),
                data: vec![0; 9],
            },
        );
        assert!(matches!(
            reply,
            Some(Response::Error {
                status: Status::TooLarge,
                ..
            })
        ));
        assert!(!store.contains("/big").unwrap());
    }

    #[test]
    fn test_lock_twice_by_holder_is_ok() {
        let store = store(4, 64);
        let notifier = Notifier::new();
        dispatch(&store, &notifier, C1, open("/f", OpenFlags::CREATE | OpenFlags::LOCK));
        dispatch(
            &store,
            &notifier,
            C1,
            Request::WriteFile {
                pathname: "/f".into(),
                data: vec![],
            },
        );
        let lock = Request::LockFile { pathname: "/f".into() };
        assert_eq!(dispatch(&store, &notifier, C1, lock), Some(Response::Ok));
    }
}
