use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use typix_contracts::chat::{
    Attachment, AttachmentType, Chat, Generation, Message, MessageType, ObservedStatus,
};
use typix_contracts::error::ServiceError;

use crate::data_uri;
use crate::dispatch::{DispatchJob, Dispatcher};
use crate::providers::map_object;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// The acting user. Every operation re-checks ownership against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: String,
}

impl RequestContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AttachmentInput {
    /// Data URI or bare base64 image.
    pub data: String,
    #[serde(rename = "type", default)]
    pub kind: AttachmentType,
}

impl AttachmentInput {
    pub fn image(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            kind: AttachmentType::Image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateChat {
    pub title: Option<String>,
    pub provider: String,
    pub model: String,
    /// First prompt; when present the chat starts with a user/assistant pair.
    pub content: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentInput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateMessage {
    pub chat_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentInput>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UpdateChat {
    pub id: String,
    pub title: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttachmentView {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AttachmentType,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationView {
    #[serde(flatten)]
    pub generation: Generation,
    pub observed_status: ObservedStatus,
    pub result_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub attachments: Vec<AttachmentView>,
    pub generation: Option<GenerationView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatView {
    #[serde(flatten)]
    pub chat: Chat,
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateMessageResponse {
    pub user_message: MessageView,
    pub assistant_message: MessageView,
}

impl CreateMessageResponse {
    pub fn generation_id(&self) -> Option<&str> {
        self.assistant_message.message.generation_id.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateChatResponse {
    pub id: String,
    pub messages: Option<CreateMessageResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegenerateResponse {
    pub message_id: String,
    pub generation_id: String,
}

/// Client-facing chat operations. Calls return as soon as records are written; generation
/// results arrive through [`ChatService::get_generation_status`].
#[derive(Clone)]
pub struct ChatService {
    dispatcher: Dispatcher,
}

impl ChatService {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn create_chat(
        &self,
        ctx: &RequestContext,
        req: CreateChat,
    ) -> ServiceResult<CreateChatResponse> {
        self.ensure_model(&req.provider, &req.model)?;
        let chat = Chat::new(&ctx.user_id, req.title, &req.provider, &req.model);
        let chat_id = chat.id.clone();
        self.dispatcher.store().insert_chat(chat)?;
        self.dispatcher.events().record(
            "chat_created",
            map_object(json!({
                "chat_id": chat_id,
                "provider": req.provider,
                "model": req.model,
            })),
        );

        let first_prompt = req.content.filter(|content| !content.trim().is_empty());
        let messages = match first_prompt {
            Some(content) => Some(self.create_message(
                ctx,
                CreateMessage {
                    chat_id: chat_id.clone(),
                    content,
                    kind: MessageType::Text,
                    provider: req.provider,
                    model: req.model,
                    attachments: req.attachments,
                },
            )?),
            None => None,
        };
        Ok(CreateChatResponse {
            id: chat_id,
            messages,
        })
    }

    /// Non-deleted chats of the caller, newest first.
    pub fn get_chats(&self, ctx: &RequestContext) -> ServiceResult<Vec<Chat>> {
        Ok(self.dispatcher.store().list_chats(&ctx.user_id)?)
    }

    pub fn get_chat_by_id(&self, ctx: &RequestContext, id: &str) -> ServiceResult<Option<ChatView>> {
        let Some(chat) = self.visible_chat(ctx, id)? else {
            return Ok(None);
        };
        let now = Utc::now();
        let messages = self
            .dispatcher
            .store()
            .list_messages(&chat.id)?
            .into_iter()
            .map(|message| self.message_view(ctx, message, now))
            .collect::<ServiceResult<Vec<MessageView>>>()?;
        Ok(Some(ChatView { chat, messages }))
    }

    pub fn update_chat(&self, ctx: &RequestContext, req: UpdateChat) -> ServiceResult<()> {
        let Some(mut chat) = self.visible_chat(ctx, &req.id)? else {
            return Err(ServiceError::not_found("chat not found"));
        };
        let provider = non_blank(req.provider).unwrap_or_else(|| chat.provider.clone());
        let model = non_blank(req.model).unwrap_or_else(|| chat.model.clone());
        if provider != chat.provider || model != chat.model {
            self.ensure_model(&provider, &model)?;
        }
        chat.provider = provider;
        chat.model = model;
        if let Some(title) = non_blank(req.title) {
            chat.title = Some(title);
        }
        chat.touch();
        self.dispatcher.store().update_chat(&chat)?;
        Ok(())
    }

    /// Soft delete. `false` when the chat is missing or not the caller's.
    pub fn delete_chat(&self, ctx: &RequestContext, id: &str) -> ServiceResult<bool> {
        let Some(mut chat) = self.dispatcher.store().get_chat(id)? else {
            return Ok(false);
        };
        if chat.user_id != ctx.user_id {
            return Ok(false);
        }
        chat.deleted = true;
        self.dispatcher.store().update_chat(&chat)?;
        Ok(true)
    }

    pub fn create_message(
        &self,
        ctx: &RequestContext,
        req: CreateMessage,
    ) -> ServiceResult<CreateMessageResponse> {
        let Some(mut chat) = self.visible_chat(ctx, &req.chat_id)? else {
            return Err(ServiceError::not_found("chat not found"));
        };
        self.ensure_model(&req.provider, &req.model)?;
        // uploads are stored and forwarded as data URIs whatever form they arrived in
        let mut user_images = Vec::with_capacity(req.attachments.len());
        for (idx, attachment) in req.attachments.iter().enumerate() {
            let decoded = data_uri::decode(&attachment.data).map_err(|err| {
                ServiceError::invalid_parameter(format!(
                    "attachment {idx} is not a valid image: {err:#}"
                ))
            })?;
            user_images.push(data_uri::encode(&decoded.bytes, &decoded.mime_type));
        }

        let store = self.dispatcher.store();
        let user_message = Message::user(&chat.id, &ctx.user_id, &req.content, req.kind);
        store.insert_message(user_message.clone())?;

        if !user_images.is_empty() {
            let file_ids = self.dispatcher.files().save(&user_images, &ctx.user_id)?;
            for file_id in &file_ids {
                store.insert_attachment(Attachment::image(&user_message.id, file_id))?;
            }
        }
        chat.touch();
        store.update_chat(&chat)?;

        let generation = Generation::pending(&ctx.user_id, &req.content, &req.provider, &req.model);
        let assistant = Message::assistant_image(&chat.id, &ctx.user_id, &generation.id);
        store.insert_generation_turn(generation.clone(), assistant.clone())?;
        self.dispatcher.events().record(
            "message_created",
            map_object(json!({
                "chat_id": chat.id,
                "user_message_id": user_message.id,
                "assistant_message_id": assistant.id,
                "generation_id": generation.id,
                "attachments": user_images.len(),
            })),
        );

        let now = Utc::now();
        let response = CreateMessageResponse {
            user_message: self.message_view(ctx, user_message, now)?,
            assistant_message: MessageView {
                generation: Some(self.generation_view(ctx, generation.clone(), now)?),
                message: assistant.clone(),
                attachments: Vec::new(),
            },
        };

        self.dispatcher.dispatch(DispatchJob {
            generation_id: generation.id,
            user_id: ctx.user_id.clone(),
            chat_id: chat.id,
            message_id: assistant.id,
            prompt: req.content,
            provider_id: req.provider,
            model_id: req.model,
            user_images,
        });
        Ok(response)
    }

    pub fn delete_message(&self, ctx: &RequestContext, message_id: &str) -> ServiceResult<()> {
        let store = self.dispatcher.store();
        let message = store.get_message(message_id)?;
        let chat = match message.as_ref() {
            Some(message) => store.get_chat(&message.chat_id)?,
            None => None,
        };
        let Some(mut chat) = chat.filter(|chat| chat.user_id == ctx.user_id) else {
            return Err(ServiceError::not_found("message not found"));
        };
        store.delete_message(message_id)?;
        chat.touch();
        store.update_chat(&chat)?;
        Ok(())
    }

    /// `None` for unknown ids and for generations owned by someone else.
    pub fn get_generation_status(
        &self,
        ctx: &RequestContext,
        generation_id: &str,
    ) -> ServiceResult<Option<GenerationView>> {
        let generation = self
            .dispatcher
            .store()
            .get_generation(generation_id)?
            .filter(|generation| generation.user_id == ctx.user_id);
        match generation {
            Some(generation) => Ok(Some(self.generation_view(ctx, generation, Utc::now())?)),
            None => Ok(None),
        }
    }

    pub fn regenerate_message(
        &self,
        ctx: &RequestContext,
        message_id: &str,
    ) -> ServiceResult<RegenerateResponse> {
        let store = self.dispatcher.store();
        let Some(mut message) = store
            .get_message(message_id)?
            .filter(|message| message.user_id == ctx.user_id && message.is_assistant_image())
        else {
            return Err(ServiceError::not_found("message not found or not regeneratable"));
        };
        let generation = match message.generation_id.as_deref() {
            Some(generation_id) => store.get_generation(generation_id)?,
            None => None,
        };
        let Some(mut generation) = generation else {
            return Err(ServiceError::invalid_parameter(
                "message has no generation to regenerate",
            ));
        };
        let Some(mut chat) = store.get_chat(&message.chat_id)? else {
            return Err(ServiceError::not_found("chat not found"));
        };

        let previous = generation.status;
        generation.reset();
        store.update_generation(&generation)?;
        message.content.clear();
        store.update_message(&message)?;
        chat.touch();
        store.update_chat(&chat)?;
        self.dispatcher.events().record(
            "generation_reset",
            map_object(json!({
                "generation_id": generation.id,
                "message_id": message.id,
                "previous_status": previous,
            })),
        );

        self.dispatcher.dispatch(DispatchJob {
            generation_id: generation.id.clone(),
            user_id: ctx.user_id.clone(),
            chat_id: chat.id,
            message_id: message.id.clone(),
            prompt: generation.prompt,
            provider_id: generation.provider,
            model_id: generation.model,
            user_images: Vec::new(),
        });
        Ok(RegenerateResponse {
            message_id: message.id,
            generation_id: generation.id,
        })
    }

    fn visible_chat(&self, ctx: &RequestContext, id: &str) -> ServiceResult<Option<Chat>> {
        Ok(self
            .dispatcher
            .store()
            .get_chat(id)?
            .filter(|chat| chat.is_visible_to(&ctx.user_id)))
    }

    fn ensure_model(&self, provider: &str, model: &str) -> ServiceResult<()> {
        if self.dispatcher.providers().get(provider).is_none() {
            return Err(ServiceError::invalid_parameter(format!(
                "provider '{provider}' not found"
            )));
        }
        if !self.dispatcher.providers().contains_model(provider, model) {
            return Err(ServiceError::invalid_parameter(format!(
                "model '{model}' not found for provider '{provider}'"
            )));
        }
        Ok(())
    }

    fn message_view(
        &self,
        ctx: &RequestContext,
        message: Message,
        now: DateTime<Utc>,
    ) -> ServiceResult<MessageView> {
        let store = self.dispatcher.store();
        let mut attachments = Vec::new();
        for attachment in store.list_attachments(&message.id)? {
            attachments.push(AttachmentView {
                url: self.dispatcher.files().url_for(&attachment.file_id, &ctx.user_id)?,
                id: attachment.id,
                kind: attachment.kind,
            });
        }
        let generation = match message.generation_id.as_deref() {
            Some(generation_id) => store.get_generation(generation_id)?,
            None => None,
        };
        let generation = match generation {
            Some(generation) => Some(self.generation_view(ctx, generation, now)?),
            None => None,
        };
        Ok(MessageView {
            message,
            attachments,
            generation,
        })
    }

    fn generation_view(
        &self,
        ctx: &RequestContext,
        generation: Generation,
        now: DateTime<Utc>,
    ) -> ServiceResult<GenerationView> {
        let mut result_urls = Vec::new();
        for file_id in generation.result_files() {
            if let Some(url) = self.dispatcher.files().url_for(file_id, &ctx.user_id)? {
                result_urls.push(url);
            }
        }
        Ok(GenerationView {
            observed_status: generation.observed_status(now),
            generation,
            result_urls,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
