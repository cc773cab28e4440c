use chrono::{DateTime, Utc};

/// One message of a chat transcript, as fed into prompt construction.
pub struct TranscriptEntry {
    pub username: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// System instruction for the in-chat assistant.
pub const ASSISTANT_SYSTEM: &str = "\
You are a chat assistant. Answer briefly and to the point, without filler.

Format your reply as Markdown:
- bold (**) for names and key words
- bulleted lists with -
- horizontal rules to separate blocks of different topics, but never at the
  very start or the very end of the reply, and always with a blank line
  around each rule
- when you produce a list, give it a bold title so it stands apart";

/// System instruction for the group summary endpoint.
pub const SUMMARY_SYSTEM: &str = "\
Below is the message history of a group chat. Reply with:
- a one-or-two sentence summary of what the chat is about
- the participants, with their apparent roles, as bullet points
- the tone of the conversation (businesslike, casual, ...)
- the activity level (low to high)
- key events and decisions
- notable details, running jokes or accents that give the chat its flavour

Format the reply as Markdown: bold (**) for names and key words, bulleted
lists with -, horizontal rules between blocks (never before the first block
or after the last, always with a blank line around each rule), and a bold
title on every list.";

/// System instruction for the suggested-question snippets endpoint. The
/// model must answer with bare JSON since the reply is parsed directly.
pub const SNIPPETS_SYSTEM: &str = "\
Analyse the following conversation and reply with 3 to 5 short snippets as a
JSON array, in the form { \"snippets\": [\"snippet1\", \"snippet2\"] }.
Each snippet is a question a participant might want to ask an AI assistant
about this chat, e.g.: What is this chat about? Where did we decide to go?
Who started the trip idea? Keep every snippet short enough for a one-line
button on a phone. The snippets are consumed by an AI assistant, not shown
as answers, so favour key questions about the chat itself.
Reply with valid JSON only — the response is fed straight into a parser.
If the conversation is too short to tell, reply with an empty array.
The conversation follows:";

/// Format a transcript the way every prompt in this crate expects it.
pub fn format_transcript(entries: &[TranscriptEntry]) -> String {
    entries
        .iter()
        .map(|entry| {
            format!(
                "[{} - {}]\n{}",
                entry.username,
                entry.timestamp.to_rfc3339(),
                entry.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The assistant turn's user prompt: the user's message plus the chat
/// history for context.
pub fn assistant_prompt(user_text: &str, transcript: &str) -> String {
    format!(
        "{user_text}\n\n\
         Here is the history of the chat. If the user is asking about the\n\
         chat, answer about the chat; otherwise answer their message\n\
         directly.\n\
         {transcript}"
    )
}

/// Prompt for generating a JSON user profile out of a message history.
pub fn profile_prompt(transcript: &str) -> String {
    format!(
        "You are an assistant that generates a JSON profile of a user from\n\
         their message history. Use ONLY this schema:\n\
         \n\
         {{\n\
           \"nickname\": \"string\",\n\
           \"categories\": [\"string\"],\n\
           \"emotion_level\": \"number (0..1)\",\n\
           \"emotion_label\": \"string\",\n\
           \"messages_count\": \"integer\",\n\
           \"activity_level\": \"number (0..1)\",\n\
           \"status\": \"string\",\n\
           \"favorite_emoji\": \"string (emoji)\",\n\
           \"badges\": [{{ \"icon\": \"string (emoji)\", \"label\": \"string\" }}],\n\
           \"quote\": \"string\",\n\
           \"ai_advice\": \"string\",\n\
           \"ai_profile_summary\": \"string\",\n\
           \"ai_achievements\": [\"string\"],\n\
           \"ai_headline\": \"string\",\n\
           \"ai_style\": \"string\",\n\
           \"ai_current_mood\": \"string\",\n\
           \"ai_support_score\": \"number (0..1)\"\n\
         }}\n\
         \n\
         nickname: the user's name or handle. categories: their apparent\n\
         interests. emotion_level / emotion_label: current emotional level\n\
         and its name. messages_count: how many messages they sent.\n\
         activity_level: 0..1. status: a short status line.\n\
         favorite_emoji: the emoji they use most. badges: icon+label pairs.\n\
         quote: a personal quote. ai_advice: advice from the assistant.\n\
         ai_profile_summary: a short profile resume. ai_achievements:\n\
         achievement names. ai_headline: a one-line description.\n\
         ai_style: their communication style. ai_current_mood: current\n\
         mood. ai_support_score: how supported they are by others, 0..1.\n\
         \n\
         Here is the user's message history:\n\
         {transcript}\n\
         \n\
         Where the history is too thin to fill a field, use neutral values:\n\
         empty strings, zeros, null or arrays of zeros. Reply with valid\n\
         JSON only."
    )
}
