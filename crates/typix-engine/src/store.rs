use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use indexmap::IndexMap;
use typix_contracts::chat::{new_id, Attachment, Chat, Generation, Message, MessageType, Role};
use uuid::Uuid;

use crate::data_uri;

/// Persistence collaborator. Every method is a single-record operation except
/// [`ChatStore::insert_generation_turn`], which must be atomic.
pub trait ChatStore: Send + Sync {
    fn insert_chat(&self, chat: Chat) -> Result<()>;
    fn get_chat(&self, id: &str) -> Result<Option<Chat>>;
    fn update_chat(&self, chat: &Chat) -> Result<()>;
    /// Non-deleted chats of `user_id`, newest first.
    fn list_chats(&self, user_id: &str) -> Result<Vec<Chat>>;

    fn insert_message(&self, message: Message) -> Result<()>;
    fn get_message(&self, id: &str) -> Result<Option<Message>>;
    fn update_message(&self, message: &Message) -> Result<()>;
    /// Removes the message with its attachments and generation.
    fn delete_message(&self, id: &str) -> Result<()>;
    /// Messages of `chat_id` in creation order.
    fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>>;

    fn insert_attachment(&self, attachment: Attachment) -> Result<()>;
    fn list_attachments(&self, message_id: &str) -> Result<Vec<Attachment>>;

    /// Creates a pending generation together with the assistant message that owns it.
    fn insert_generation_turn(&self, generation: Generation, message: Message) -> Result<()>;
    fn get_generation(&self, id: &str) -> Result<Option<Generation>>;
    fn update_generation(&self, generation: &Generation) -> Result<()>;

    /// Result files of the most recent assistant image message in `chat_id` whose
    /// generation produced at least one file, skipping `exclude_message_id`.
    fn latest_result_files(
        &self,
        chat_id: &str,
        exclude_message_id: Option<&str>,
    ) -> Result<Option<Vec<String>>>;
}

/// Blob collaborator for generated images and user uploads.
pub trait FileStore: Send + Sync {
    /// Persists data-URI images in order and returns their ids in the same order.
    fn save(&self, images: &[String], owner_id: &str) -> Result<Vec<String>>;
    /// The image as a data URI, or `None` when missing or owned by someone else.
    fn read(&self, file_id: &str, owner_id: &str) -> Result<Option<String>>;
    fn url_for(&self, file_id: &str, owner_id: &str) -> Result<Option<String>>;
}

#[derive(Debug, Default)]
struct Tables {
    chats: IndexMap<String, Chat>,
    messages: IndexMap<String, Message>,
    attachments: IndexMap<String, Attachment>,
    generations: HashMap<String, Generation>,
}

/// In-process [`ChatStore`]; message insertion order is the creation order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

impl ChatStore for MemoryStore {
    fn insert_chat(&self, chat: Chat) -> Result<()> {
        let mut tables = self.tables()?;
        if tables.chats.contains_key(&chat.id) {
            bail!("chat {} already exists", chat.id);
        }
        tables.chats.insert(chat.id.clone(), chat);
        Ok(())
    }

    fn get_chat(&self, id: &str) -> Result<Option<Chat>> {
        Ok(self.tables()?.chats.get(id).cloned())
    }

    fn update_chat(&self, chat: &Chat) -> Result<()> {
        let mut tables = self.tables()?;
        let Some(slot) = tables.chats.get_mut(&chat.id) else {
            bail!("chat {} not found", chat.id);
        };
        *slot = chat.clone();
        Ok(())
    }

    fn list_chats(&self, user_id: &str) -> Result<Vec<Chat>> {
        let tables = self.tables()?;
        let mut chats = tables
            .chats
            .values()
            .filter(|chat| chat.is_visible_to(user_id))
            .cloned()
            .collect::<Vec<Chat>>();
        chats.reverse();
        chats.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(chats)
    }

    fn insert_message(&self, message: Message) -> Result<()> {
        let mut tables = self.tables()?;
        if !tables.chats.contains_key(&message.chat_id) {
            bail!("chat {} not found for message {}", message.chat_id, message.id);
        }
        tables.messages.insert(message.id.clone(), message);
        Ok(())
    }

    fn get_message(&self, id: &str) -> Result<Option<Message>> {
        Ok(self.tables()?.messages.get(id).cloned())
    }

    fn update_message(&self, message: &Message) -> Result<()> {
        let mut tables = self.tables()?;
        let Some(slot) = tables.messages.get_mut(&message.id) else {
            bail!("message {} not found", message.id);
        };
        *slot = message.clone();
        Ok(())
    }

    fn delete_message(&self, id: &str) -> Result<()> {
        let mut tables = self.tables()?;
        let Some(message) = tables.messages.shift_remove(id) else {
            return Ok(());
        };
        tables
            .attachments
            .retain(|_, attachment| attachment.message_id != message.id);
        if let Some(generation_id) = message.generation_id.as_deref() {
            tables.generations.remove(generation_id);
        }
        Ok(())
    }

    fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .tables()?
            .messages
            .values()
            .filter(|message| message.chat_id == chat_id)
            .cloned()
            .collect())
    }

    fn insert_attachment(&self, attachment: Attachment) -> Result<()> {
        let mut tables = self.tables()?;
        if !tables.messages.contains_key(&attachment.message_id) {
            bail!("message {} not found for attachment", attachment.message_id);
        }
        tables.attachments.insert(attachment.id.clone(), attachment);
        Ok(())
    }

    fn list_attachments(&self, message_id: &str) -> Result<Vec<Attachment>> {
        Ok(self
            .tables()?
            .attachments
            .values()
            .filter(|attachment| attachment.message_id == message_id)
            .cloned()
            .collect())
    }

    fn insert_generation_turn(&self, generation: Generation, message: Message) -> Result<()> {
        let mut tables = self.tables()?;
        if message.generation_id.as_deref() != Some(generation.id.as_str()) {
            bail!(
                "assistant message {} does not reference generation {}",
                message.id,
                generation.id
            );
        }
        if !tables.chats.contains_key(&message.chat_id) {
            bail!("chat {} not found for message {}", message.chat_id, message.id);
        }
        tables.generations.insert(generation.id.clone(), generation);
        tables.messages.insert(message.id.clone(), message);
        Ok(())
    }

    fn get_generation(&self, id: &str) -> Result<Option<Generation>> {
        Ok(self.tables()?.generations.get(id).cloned())
    }

    fn update_generation(&self, generation: &Generation) -> Result<()> {
        let mut tables = self.tables()?;
        let Some(slot) = tables.generations.get_mut(&generation.id) else {
            bail!("generation {} not found", generation.id);
        };
        *slot = generation.clone();
        Ok(())
    }

    fn latest_result_files(
        &self,
        chat_id: &str,
        exclude_message_id: Option<&str>,
    ) -> Result<Option<Vec<String>>> {
        let tables = self.tables()?;
        let found = tables
            .messages
            .values()
            .rev()
            .filter(|message| {
                message.chat_id == chat_id
                    && message.role == Role::Assistant
                    && message.kind == MessageType::Image
                    && Some(message.id.as_str()) != exclude_message_id
            })
            .filter_map(|message| message.generation_id.as_deref())
            .filter_map(|generation_id| tables.generations.get(generation_id))
            .map(|generation| generation.result_files())
            .find(|files| !files.is_empty())
            .map(|files| files.to_vec());
        Ok(found)
    }
}

/// Writes images under `<root>/<owner>/<file id>.<ext>`; ownership is the directory.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create file store at {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn owner_dir(&self, owner_id: &str) -> Result<PathBuf> {
        let safe = !owner_id.is_empty()
            && owner_id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'));
        if !safe {
            bail!("owner id '{owner_id}' is not a valid storage key");
        }
        Ok(self.root.join(owner_id))
    }

    fn locate(&self, file_id: &str, owner_id: &str) -> Result<Option<PathBuf>> {
        if Uuid::parse_str(file_id).is_err() {
            return Ok(None);
        }
        let dir = self.owner_dir(owner_id)?;
        if !dir.exists() {
            return Ok(None);
        }
        for entry in fs::read_dir(&dir).with_context(|| format!("failed to list {}", dir.display()))? {
            let path = entry?.path();
            if path.file_stem().and_then(|stem| stem.to_str()) == Some(file_id) {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

impl FileStore for LocalFileStore {
    fn save(&self, images: &[String], owner_id: &str) -> Result<Vec<String>> {
        let dir = self.owner_dir(owner_id)?;
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let mut ids = Vec::with_capacity(images.len());
        for image in images {
            let decoded = data_uri::decode(image)?;
            let file_id = new_id();
            let path = dir.join(format!("{file_id}.{}", decoded.extension()));
            fs::write(&path, &decoded.bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            ids.push(file_id);
        }
        Ok(ids)
    }

    fn read(&self, file_id: &str, owner_id: &str) -> Result<Option<String>> {
        let Some(path) = self.locate(file_id, owner_id)? else {
            return Ok(None);
        };
        let bytes = fs::read(&path).with_context(|| format!("failed reading {}", path.display()))?;
        let mime = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(mime_for_extension)
            .or_else(|| data_uri::sniff_mime(&bytes))
            .unwrap_or("image/png");
        Ok(Some(data_uri::encode(&bytes, mime)))
    }

    fn url_for(&self, file_id: &str, owner_id: &str) -> Result<Option<String>> {
        let Some(path) = self.locate(file_id, owner_id)? else {
            return Ok(None);
        };
        let absolute = fs::canonicalize(&path).unwrap_or(path);
        Ok(Some(format!("file://{}", absolute.to_string_lossy())))
    }
}

/// In-process [`FileStore`] keeping data URIs as-is.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: Mutex<HashMap<String, (String, String)>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.lock().map(|files| files.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seeds a file directly, for callers that need known ids.
    pub fn insert(&self, file_id: &str, owner_id: &str, data: &str) -> Result<()> {
        self.files
            .lock()
            .map_err(|_| anyhow!("memory file store lock poisoned"))?
            .insert(file_id.to_string(), (owner_id.to_string(), data.to_string()));
        Ok(())
    }
}

impl FileStore for MemoryFileStore {
    fn save(&self, images: &[String], owner_id: &str) -> Result<Vec<String>> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| anyhow!("memory file store lock poisoned"))?;
        let mut ids = Vec::with_capacity(images.len());
        for image in images {
            data_uri::decode(image)?;
            let file_id = new_id();
            files.insert(file_id.clone(), (owner_id.to_string(), image.clone()));
            ids.push(file_id);
        }
        Ok(ids)
    }

    fn read(&self, file_id: &str, owner_id: &str) -> Result<Option<String>> {
        let files = self
            .files
            .lock()
            .map_err(|_| anyhow!("memory file store lock poisoned"))?;
        Ok(files
            .get(file_id)
            .filter(|(owner, _)| owner == owner_id)
            .map(|(_, data)| data.clone()))
    }

    fn url_for(&self, file_id: &str, owner_id: &str) -> Result<Option<String>> {
        let files = self
            .files
            .lock()
            .map_err(|_| anyhow!("memory file store lock poisoned"))?;
        Ok(files
            .get(file_id)
            .filter(|(owner, _)| owner == owner_id)
            .map(|_| format!("memory://{owner_id}/{file_id}")))
    }
}

fn mime_for_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/png",
    }
}
