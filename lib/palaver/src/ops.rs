use crate::directory::DirError;
use crate::logging;
use crate::net::codec::{self, FdIo, NetResult};
use crate::net::frame::{Message, MessageHdr, Op};
use crate::server::ServerCtx;
use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

/// What the worker does with the descriptor after a handler returns: re-arm
/// it in the ready set, or disconnect by descriptor and forget it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Outcome {
    Keep,
    Drop,
}

/// Routes one parsed request to its handler. Unknown opcodes get `Fail`.
pub fn dispatch(ctx: &ServerCtx, msg: Message, fd: RawFd) -> Outcome {
    match Op::decode(msg.hdr.op) {
        Some(Op::Register) => register(ctx, msg, fd),
        Some(Op::Connect) => connect(ctx, msg, fd),
        Some(Op::PostTxt) => post_txt(ctx, msg, fd),
        Some(Op::PostTxtAll) => post_txt_all(ctx, msg, fd),
        Some(Op::PostFile) => post_file(ctx, msg, fd),
        Some(Op::GetFile) => get_file(ctx, msg, fd),
        Some(Op::GetPrevMsgs) => get_prev_msgs(ctx, msg, fd),
        Some(Op::UsrList) => usr_list(ctx, msg, fd),
        Some(Op::Unregister) => unregister(ctx, msg, fd),
        Some(Op::Disconnect) => disconnect(ctx, msg, fd),
        _ => {
            logging::warn!(ctx.log, "unknown opcode";
                           "context" => "dispatch",
                           "op" => msg.hdr.op,
                           "sender" => %msg.hdr.sender);
            ctx.stats.update(|c| c.nerrors += 1);
            ack_and_drop(ctx, fd, Op::Fail)
        }
    }
}

/// Writes a full reply frame under the descriptor's write shard.
fn send_msg(ctx: &ServerCtx, fd: RawFd, msg: &Message) -> NetResult<()> {
    let _guard = ctx.serializer.write_lock(fd);
    codec::send_msg(&mut FdIo(fd), msg)
}

/// Writes a header-only reply under the descriptor's write shard.
pub(crate) fn send_ack(ctx: &ServerCtx, fd: RawFd, op: Op) -> NetResult<()> {
    let _guard = ctx.serializer.write_lock(fd);
    codec::send_header(&mut FdIo(fd), &MessageHdr::ack(op))
}

/// Acks and keeps the descriptor; drops it only if the ack itself fails.
fn ack_and_keep(ctx: &ServerCtx, fd: RawFd, op: Op) -> Outcome {
    match send_ack(ctx, fd, op) {
        Ok(()) => Outcome::Keep,
        Err(_) => Outcome::Drop,
    }
}

/// Best-effort ack on a path that forfeits the descriptor regardless.
fn ack_and_drop(ctx: &ServerCtx, fd: RawFd, op: Op) -> Outcome {
    let _ = send_ack(ctx, fd, op);
    Outcome::Drop
}

/// OK reply whose payload is the packed users-online snapshot.
fn reply_online_snapshot(ctx: &ServerCtx, fd: RawFd) -> Outcome {
    let (buf, _count) = ctx.directory.users_online_snapshot();
    match send_msg(ctx, fd, &Message::server_reply(Op::Ok, buf)) {
        Ok(()) => Outcome::Keep,
        Err(_) => Outcome::Drop,
    }
}

/// Resolves a client-supplied filename inside the file store. At most one
/// leading `./` is stripped.
fn store_path(ctx: &ServerCtx, filename: &[u8]) -> PathBuf {
    let name = filename.strip_prefix(b"./").unwrap_or(filename);
    ctx.config.dir_name.join(OsStr::from_bytes(name))
}

fn register(ctx: &ServerCtx, msg: Message, fd: RawFd) -> Outcome {
    let sender = msg.hdr.sender;
    logging::debug!(ctx.log, "register"; "context" => "register", "sender" => %sender, "fd" => fd);

    match ctx.directory.register(&sender) {
        Ok(()) => {
            ctx.stats.update(|c| c.nusers += 1);
            match ctx.directory.connect(&sender, fd) {
                Ok(()) => {
                    ctx.stats.update(|c| c.nonline += 1);
                    reply_online_snapshot(ctx, fd)
                }
                Err(err) => {
                    logging::warn!(ctx.log, "connect after register failed";
                                   "context" => "register",
                                   "sender" => %sender,
                                   "error" => ?err);
                    ack_and_keep(ctx, fd, Op::Fail)
                }
            }
        }
        Err(DirError::AlreadyRegistered) => {
            ctx.stats.update(|c| c.nerrors += 1);
            ack_and_keep(ctx, fd, Op::NickAlready)
        }
        Err(_) => {
            ctx.stats.update(|c| c.nerrors += 1);
            ack_and_keep(ctx, fd, Op::Fail)
        }
    }
}

fn connect(ctx: &ServerCtx, msg: Message, fd: RawFd) -> Outcome {
    let sender = msg.hdr.sender;
    logging::debug!(ctx.log, "connect"; "context" => "connect", "sender" => %sender, "fd" => fd);

    match ctx.directory.connect(&sender, fd) {
        Ok(()) => {
            ctx.stats.update(|c| c.nonline += 1);
            reply_online_snapshot(ctx, fd)
        }
        Err(DirError::NotFound) => {
            ctx.stats.update(|c| c.nerrors += 1);
            ack_and_keep(ctx, fd, Op::NickUnknown)
        }
        Err(_) => {
            ctx.stats.update(|c| c.nerrors += 1);
            ack_and_keep(ctx, fd, Op::Fail)
        }
    }
}

fn post_txt(ctx: &ServerCtx, mut msg: Message, fd: RawFd) -> Outcome {
    logging::debug!(ctx.log, "post text";
                    "context" => "posttxt",
                    "sender" => %msg.hdr.sender,
                    "receiver" => %msg.data.receiver,
                    "len" => msg.data.buf.len());

    if msg.data.buf.len() > ctx.config.max_msg_size {
        ctx.stats.update(|c| c.nerrors += 1);
        return ack_and_drop(ctx, fd, Op::MsgTooLong);
    }

    let receiver = msg.data.receiver;
    let user = match ctx.directory.get_user(&receiver) {
        Some(user) => user,
        None => {
            ctx.stats.update(|c| c.nerrors += 1);
            return ack_and_drop(ctx, fd, Op::Fail);
        }
    };

    msg.hdr.op = Op::TxtMessage.into();

    if let Some(peer) = user.fd {
        if send_msg(ctx, peer, &msg).is_err() {
            ctx.stats.update(|c| c.nerrors += 1);
            return ack_and_drop(ctx, fd, Op::Fail);
        }
        ctx.stats.update(|c| {
            c.nnotdelivered -= 1;
            c.ndelivered += 1;
        });
    }

    // A copy always lands in the receiver's history, delivered or not.
    user.history.insert(msg);
    ctx.stats.update(|c| c.nnotdelivered += 1);

    ack_and_keep(ctx, fd, Op::Ok)
}

fn post_txt_all(ctx: &ServerCtx, mut msg: Message, fd: RawFd) -> Outcome {
    let sender = msg.hdr.sender;
    logging::debug!(ctx.log, "post text broadcast";
                    "context" => "posttxtall",
                    "sender" => %sender,
                    "len" => msg.data.buf.len());

    if msg.data.buf.len() > ctx.config.max_msg_size {
        ctx.stats.update(|c| c.nerrors += 1);
        return ack_and_drop(ctx, fd, Op::MsgTooLong);
    }

    msg.hdr.op = Op::TxtMessage.into();

    ctx.directory.for_each_registered(|name, user| {
        if *name == sender {
            return;
        }

        let copy = msg.clone();
        if let Some(peer) = user.fd() {
            if send_msg(ctx, peer, &copy).is_ok() {
                ctx.stats.update(|c| {
                    c.nnotdelivered -= 1;
                    c.ndelivered += 1;
                });
            } else {
                logging::warn!(ctx.log, "broadcast delivery failed";
                               "context" => "posttxtall",
                               "receiver" => %name);
            }
        }

        user.history().insert(copy);
        ctx.stats.update(|c| c.nnotdelivered += 1);
    });

    ack_and_keep(ctx, fd, Op::Ok)
}

fn post_file(ctx: &ServerCtx, mut msg: Message, fd: RawFd) -> Outcome {
    logging::debug!(ctx.log, "post file";
                    "context" => "postfile",
                    "sender" => %msg.hdr.sender,
                    "receiver" => %msg.data.receiver);

    // Second data part of the request: the file bytes themselves.
    let file = {
        let _guard = ctx.serializer.read_lock(fd);
        codec::read_data(&mut FdIo(fd))
    };
    let file = match file {
        Ok(file) => file,
        Err(_) => return Outcome::Drop,
    };

    if file.buf.len() / 1024 > ctx.config.max_file_size {
        ctx.stats.update(|c| c.nerrors += 1);
        return ack_and_drop(ctx, fd, Op::MsgTooLong);
    }

    let path = store_path(ctx, &msg.data.buf);
    if let Err(err) = fs::write(&path, &file.buf) {
        logging::error!(ctx.log, "file store write failed";
                        "context" => "postfile",
                        "path" => %path.display(),
                        "error" => %err);
        return Outcome::Drop;
    }

    let receiver = msg.data.receiver;
    let user = match ctx.directory.get_user(&receiver) {
        Some(user) => user,
        None => {
            ctx.stats.update(|c| c.nerrors += 1);
            return ack_and_drop(ctx, fd, Op::Fail);
        }
    };

    // The notification carries the filename; the bytes are fetched later
    // with GETFILE.
    msg.hdr.op = Op::FileMessage.into();

    if let Some(peer) = user.fd {
        if send_msg(ctx, peer, &msg).is_err() {
            ctx.stats.update(|c| c.nerrors += 1);
            return ack_and_drop(ctx, fd, Op::Fail);
        }
        ctx.stats.update(|c| {
            c.nfilenotdelivered -= 1;
            c.nfiledelivered += 1;
        });
    }

    user.history.insert(msg);
    ctx.stats.update(|c| c.nfilenotdelivered += 1);

    ack_and_keep(ctx, fd, Op::Ok)
}

fn get_file(ctx: &ServerCtx, msg: Message, fd: RawFd) -> Outcome {
    let path = store_path(ctx, &msg.data.buf);
    logging::debug!(ctx.log, "get file";
                    "context" => "getfile",
                    "sender" => %msg.hdr.sender,
                    "path" => %path.display());

    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(_) => {
            ctx.stats.update(|c| c.nerrors += 1);
            return ack_and_drop(ctx, fd, Op::NoSuchFile);
        }
    };

    if bytes.len() / 1024 > ctx.config.max_file_size {
        ctx.stats.update(|c| c.nerrors += 1);
        return ack_and_drop(ctx, fd, Op::MsgTooLong);
    }

    match send_msg(ctx, fd, &Message::server_reply(Op::Ok, bytes)) {
        Ok(()) => Outcome::Keep,
        Err(_) => Outcome::Drop,
    }
}

fn get_prev_msgs(ctx: &ServerCtx, msg: Message, fd: RawFd) -> Outcome {
    let sender = msg.hdr.sender;
    logging::debug!(ctx.log, "get previous messages"; "context" => "getprevmsgs", "sender" => %sender);

    let history = match ctx.directory.history_of(&sender) {
        Some(history) => history,
        None => {
            ctx.stats.update(|c| c.nerrors += 1);
            return ack_and_drop(ctx, fd, Op::Fail);
        }
    };

    let msgs = history.drain();

    let count = (msgs.len() as u32).to_le_bytes().to_vec();
    if send_msg(ctx, fd, &Message::server_reply(Op::Ok, count)).is_err() {
        return Outcome::Drop;
    }

    let mut failed = false;
    for stored in msgs {
        // Parked messages become delivered as they leave the history.
        if stored.hdr.op == u8::from(Op::TxtMessage) {
            ctx.stats.update(|c| {
                c.nnotdelivered -= 1;
                c.ndelivered += 1;
            });
        } else {
            ctx.stats.update(|c| {
                c.nfilenotdelivered -= 1;
                c.nfiledelivered += 1;
            });
        }

        if send_msg(ctx, fd, &stored).is_err() {
            failed = true;
        }
    }

    if failed {
        Outcome::Drop
    } else {
        Outcome::Keep
    }
}

fn usr_list(ctx: &ServerCtx, msg: Message, fd: RawFd) -> Outcome {
    logging::debug!(ctx.log, "user list"; "context" => "usrlist", "sender" => %msg.hdr.sender);

    let (buf, count) = ctx.directory.users_online_snapshot();
    if count == 0 {
        ctx.stats.update(|c| c.nerrors += 1);
        return ack_and_drop(ctx, fd, Op::Fail);
    }

    match send_msg(ctx, fd, &Message::server_reply(Op::Ok, buf)) {
        Ok(()) => Outcome::Keep,
        Err(_) => Outcome::Drop,
    }
}

fn unregister(ctx: &ServerCtx, msg: Message, fd: RawFd) -> Outcome {
    let sender = msg.hdr.sender;
    logging::debug!(ctx.log, "unregister"; "context" => "unregister", "sender" => %sender);

    match ctx.directory.unregister(&sender) {
        Ok(was_online) => {
            ctx.stats.update(|c| {
                c.nusers -= 1;
                if was_online {
                    c.nonline -= 1;
                }
            });
            ack_and_keep(ctx, fd, Op::Ok)
        }
        Err(_) => {
            ctx.stats.update(|c| c.nerrors += 1);
            ack_and_drop(ctx, fd, Op::Fail)
        }
    }
}

fn disconnect(ctx: &ServerCtx, msg: Message, fd: RawFd) -> Outcome {
    let sender = msg.hdr.sender;
    logging::debug!(ctx.log, "disconnect"; "context" => "disconnect", "sender" => %sender);

    match ctx.directory.disconnect(&sender) {
        Ok(()) => {
            ctx.stats.update(|c| c.nonline -= 1);
            ack_and_keep(ctx, fd, Op::Ok)
        }
        Err(DirError::NotFound) | Err(DirError::AlreadyOffline) => {
            ctx.stats.update(|c| c.nerrors += 1);
            ack_and_drop(ctx, fd, Op::NickUnknown)
        }
        Err(_) => {
            ctx.stats.update(|c| c.nerrors += 1);
            ack_and_drop(ctx, fd, Op::Fail)
        }
    }
}
