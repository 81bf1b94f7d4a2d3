use std::{fs, os::unix::fs::MetadataExt};

use empath_common::tracing;

use super::{
    ControlFile, DELAY_SLOT, FormatFlags, NotifyFlags, PID_SLOT, Sender, State, Tag, lock,
};
use crate::{
    error::ParseError,
    spool::{self, Spool, split_dir_hash},
};

/// Longest single-line record accepted
pub const RECORD_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub now: u64,
    /// How long a recipient locked by a live worker is left alone
    pub lock_backoff: u64,
    /// Re-reading a file we already schedule: locks are our own workers'
    pub rereading: bool,
}

/// One pending recipient, as found in the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientRecord {
    /// Record index in [`ControlFile::offsets`]
    pub record: usize,
    pub offset: usize,
    /// Lower-cased `(channel, host)`, `None` when the address is malformed
    pub destination: Option<(String, String)>,
    pub raw: String,
    pub wakeup: u64,
    pub header_offset: Option<usize>,
    pub drpt_offset: Option<usize>,
    pub notify: NotifyFlags,
    notary_seen: bool,
}

#[derive(Debug, Default)]
pub struct Parsed {
    pub file: ControlFile,
    /// Pending recipients, sorted by destination
    pub recipients: Vec<RecipientRecord>,
    /// Hosts named by turn-me records
    pub turn_me: Vec<String>,
    /// Control files this one supersedes
    pub obsoletes: Vec<String>,
    /// State byte offsets of stale locks to release
    pub unlocks: Vec<usize>,
}

/// Split the contents into `(offset, record)` pairs.
///
/// Header and MIME structure blocks run up to the next blank line; every
/// other record ends at a newline.
fn split_records(contents: &[u8]) -> Vec<(usize, &[u8])> {
    let mut records = Vec::new();
    let mut start = 0;

    while start < contents.len() {
        let block = Tag::from_byte(contents[start]).is_some_and(Tag::is_block);

        let (end, next) = if block {
            contents[start..]
                .windows(2)
                .position(|w| w == b"\n\n")
                .map_or((contents.len(), contents.len()), |p| {
                    (start + p, start + p + 2)
                })
        } else {
            contents[start..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or((contents.len(), contents.len()), |p| {
                    (start + p, start + p + 1)
                })
        };

        if end > start {
            records.push((start, &contents[start..end]));
        }
        start = next;
    }

    records
}

fn parse_number(text: &str) -> Option<u32> {
    text.strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .map_or_else(|| text.parse().ok(), |hex| u32::from_str_radix(hex, 16).ok())
}

/// Pull `(channel, host)` out of a recipient address.
///
/// The host may be a parenthesised MX list such as `((a.example)(b.example))`.
pub(crate) fn split_destination(address: &str) -> Option<(String, String)> {
    let (channel, rest) = address.trim_start().split_once(char::is_whitespace)?;
    let rest = rest.trim_start();

    let host = if rest.starts_with('(') {
        let mut depth = 0usize;
        let mut end = None;

        for (i, c) in rest.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i + 1);
                        break;
                    }
                }
                _ => {}
            }
        }

        &rest[..end?]
    } else {
        rest.split_whitespace().next()?
    };

    if channel.is_empty() || host.is_empty() {
        return None;
    }

    Some((channel.to_ascii_lowercase(), host.to_ascii_lowercase()))
}

fn text(record: &[u8]) -> String {
    String::from_utf8_lossy(record.get(2..).unwrap_or_default())
        .trim()
        .to_string()
}

/// Parse a control file's contents.
///
/// `alive` decides whether a lock holder is still running.
///
/// # Errors
///
/// Any [`ParseError`]; all of them except I/O mean the file is broken.
#[allow(clippy::too_many_lines)]
pub fn parse(
    contents: &[u8],
    options: &ParseOptions,
    alive: &dyn Fn(i32) -> bool,
) -> Result<Parsed, ParseError> {
    let mut parsed = Parsed::default();
    let file = &mut parsed.file;
    let mut last_pending: Option<usize> = None;

    for (offset, record) in split_records(contents) {
        file.offsets.push(offset);
        let index = file.offsets.len() - 1;

        let Some(tag) = Tag::from_byte(record[0]) else {
            continue;
        };

        if !tag.is_block() && record.len() > RECORD_LIMIT {
            return Err(ParseError::Oversized {
                offset,
                limit: RECORD_LIMIT,
            });
        }

        // Other records only count while their state byte says they are live
        let state = record.get(1).copied().unwrap_or(b'\n');
        let live = matches!(state, b' ' | b'\n') || (options.rereading && state == b'~');
        if tag != Tag::Recipient && !live {
            continue;
        }

        match tag {
            Tag::Format => {
                let raw = text(record);
                let bits = parse_number(&raw).ok_or_else(|| ParseError::BadFormat(raw.clone()))?;
                file.format =
                    FormatFlags::from_bits(bits).map_err(|bits| ParseError::UnknownFormat { bits })?;
            }
            Tag::Sender => {
                let raw = text(record);
                let mut parts = raw.split_whitespace();
                let sender = Sender {
                    channel: parts.next().unwrap_or_default().to_ascii_lowercase(),
                    host: parts.next().unwrap_or_default().to_ascii_lowercase(),
                    user: parts.collect::<Vec<_>>().join(" "),
                };
                if sender.channel == "error" {
                    file.error_address = Some(String::new());
                }
                file.sender = Some(sender);
            }
            Tag::Recipient => {
                last_pending = None;
                file.rcpnts_total += 1;

                let state_byte = record.get(1).copied().unwrap_or(b' ');
                let state = State::from_byte(state_byte).ok_or(ParseError::BadState {
                    offset,
                    state: char::from(state_byte),
                })?;

                let mut wakeup = 0;
                match state {
                    State::Done => continue,
                    State::Failed => {
                        file.rcpnts_failed += 1;
                        continue;
                    }
                    State::Locked if !options.rereading => {
                        match lock::holder(record, file.format) {
                            Some(pid) if alive(pid) => {
                                wakeup = options.now + options.lock_backoff;
                                tracing::info!(
                                    pid,
                                    offset,
                                    "Recipient locked by a live process, backing off"
                                );
                            }
                            _ => parsed.unlocks.push(offset + 1),
                        }
                    }
                    State::Locked | State::Normal => {}
                }

                let mut skip = 2;
                if file.format.contains(FormatFlags::PID_SLOT) {
                    skip += PID_SLOT;
                }
                if file.format.contains(FormatFlags::DELAY_SLOT) {
                    let slot = record
                        .get(skip..skip + DELAY_SLOT)
                        .ok_or(ParseError::Truncated { offset })?;
                    let slot = std::str::from_utf8(slot)
                        .map_err(|_| ParseError::BadSlot { offset })?
                        .trim();
                    if !slot.is_empty() {
                        let delay: u64 = slot.parse().map_err(|_| ParseError::BadSlot { offset })?;
                        wakeup = wakeup.max(delay);
                    }
                    skip += DELAY_SLOT;
                }

                let address = record.get(skip..).ok_or(ParseError::Truncated { offset })?;
                let raw = String::from_utf8_lossy(address).trim().to_string();

                parsed.recipients.push(RecipientRecord {
                    record: index,
                    offset,
                    destination: split_destination(&raw),
                    raw,
                    wakeup,
                    header_offset: None,
                    drpt_offset: None,
                    notify: NotifyFlags::default(),
                    notary_seen: false,
                });
                file.rcpnts_work += 1;
                last_pending = Some(parsed.recipients.len() - 1);
            }
            Tag::RecipientNotary => {
                let Some(recipient) = last_pending.and_then(|i| parsed.recipients.get_mut(i))
                else {
                    continue;
                };
                if recipient.notary_seen {
                    continue;
                }

                recipient.notary_seen = true;
                recipient.drpt_offset = Some(offset);
                if let Some(value) = text(record).split_whitespace().find_map(|word| {
                    word.get(..7)
                        .filter(|key| key.eq_ignore_ascii_case("NOTIFY="))
                        .map(|_| &word[7..])
                }) {
                    recipient.notify = NotifyFlags::parse(value);
                }
            }
            Tag::MessageHeaders => {
                for recipient in parsed.recipients.iter_mut().rev() {
                    if recipient.header_offset.is_some() {
                        break;
                    }
                    recipient.header_offset = Some(offset);
                }
            }
            Tag::MimeStructure => {}
            Tag::MessageId => file.message_id = text(record),
            Tag::BodyOffset => {
                let value = text(record);
                let Ok(body_offset) = value.parse() else {
                    return Err(ParseError::BadBodyOffset { offset, value });
                };
                file.body_offset = body_offset;
            }
            Tag::EnvelopeId => file.envelope_id = Some(text(record)),
            Tag::DsnReturnMode => file.dsn_ret_mode = Some(text(record)),
            Tag::LogIdent => file.log_ident = text(record),
            Tag::ErrorAddress => {
                if !file.is_error_message() {
                    file.error_address = Some(text(record));
                }
            }
            Tag::Obsoletes => parsed.obsoletes.push(text(record)),
            Tag::Verbose => file.verbose = Some(text(record)),
            Tag::TurnMe => parsed.turn_me.push(text(record).to_ascii_lowercase()),
            Tag::Diagnostic => file.had_error = true,
        }
    }

    if parsed.turn_me.is_empty() {
        if parsed.file.message_id.is_empty() {
            return Err(ParseError::MissingMessageId);
        }
        if parsed.file.log_ident.is_empty() {
            return Err(ParseError::MissingLogIdent);
        }
    }

    parsed.recipients.sort_by(|a, b| {
        let key = |r: &RecipientRecord| {
            r.destination
                .as_ref()
                .map(|(c, h)| (c.clone(), h.clone()))
                .unwrap_or_default()
        };
        key(a).cmp(&key(b))
    });

    Ok(parsed)
}

/// Read, parse and validate the control file `name` (relative to the
/// transport directory, hash prefix included).
///
/// Stale locks are released in the file, top-level jobs are moved into
/// hashed subdirectories when hashing is enabled, and the message body must
/// exist.
///
/// # Errors
///
/// I/O errors reading the control file, or any structural [`ParseError`].
pub fn load(
    spool: &Spool,
    name: &str,
    id: u64,
    options: &ParseOptions,
) -> Result<Parsed, ParseError> {
    let path = spool.control_path(name);
    let contents = fs::read(&path)?;
    let uid = fs::metadata(&path)?.uid();

    let mut parsed = parse(&contents, options, &lock::is_alive)?;
    drop(contents);

    if !parsed.unlocks.is_empty() {
        match lock::rewrite_states(&path, &parsed.unlocks, State::Normal) {
            Ok(()) => tracing::info!(
                name,
                released = parsed.unlocks.len(),
                "Released stale recipient locks"
            ),
            Err(err) => tracing::warn!(name, error = %err, "Unable to release stale locks"),
        }
    }

    let (dir_hash, base) = split_dir_hash(name);
    parsed.file.id = id;
    parsed.file.name = base.to_string();
    parsed.file.dir_hash = dir_hash.to_string();
    parsed.file.uid = uid;

    if !parsed.turn_me.is_empty() {
        return Ok(parsed);
    }

    let file = &mut parsed.file;
    if file.dir_hash.is_empty()
        && !options.rereading
        && let Some(prefix) = spool.relocate(&file.name, &file.message_id)
    {
        file.dir_hash = prefix;
    }

    let queue = spool.queue_path(&file.dir_hash, &file.message_id);
    match fs::metadata(&queue) {
        Ok(metadata) => file.mtime = u64::try_from(metadata.mtime()).unwrap_or_default(),
        Err(source) => {
            spool::verbose_note(
                file.verbose.as_deref(),
                "aborted due to missing information",
            );
            return Err(ParseError::MissingQueueFile {
                path: queue,
                source,
            });
        }
    }

    if !options.rereading {
        spool::verbose_note(
            file.verbose.as_deref(),
            &format!("scheduler processing {}", file.message_id),
        );
    }

    Ok(parsed)
}
