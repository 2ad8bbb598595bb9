use sticker_contracts::styles::StyleSpec;

/// Matting depends on the subject sitting on pure black; every image prompt
/// ends with this contract.
pub const BLACK_BACKGROUND_CONTRACT: &str = "Render the subject as a single die-cut sticker centered on a solid, pure black (#000000) background that fills the entire canvas. No shadows, no gradients, no vignette, no white border, no frame and no extra text.";

pub const PHOTO_SYSTEM_INSTRUCTION: &str = "You turn photos into stickers. Keep the identity, pose and defining features of the main subject from the input photo, drop everything else in the scene, and redraw the subject in the requested style.";

pub const DETECT_SUBJECT_PROMPT: &str = "Name the main subject of this image in at most six words, as a short noun phrase suitable for a sticker prompt. Reply with the phrase only.";

pub fn sticker_prompt(subject: &str, style: &StyleSpec, caption: Option<&str>) -> String {
    let mut prompt = format!(
        "Create a sticker of {}. Style: {}.",
        subject.trim(),
        style.prompt
    );
    if let Some(caption) = caption.map(str::trim).filter(|value| !value.is_empty()) {
        prompt.push_str(&format!(
            " Include the caption \"{caption}\" in bold, legible lettering as part of the sticker."
        ));
    }
    prompt.push(' ');
    prompt.push_str(BLACK_BACKGROUND_CONTRACT);
    prompt
}

pub fn photo_sticker_prompt(subject: &str, style: &StyleSpec, caption: Option<&str>) -> String {
    let subject = subject.trim();
    let subject = if subject.is_empty() {
        "the main subject of this photo"
    } else {
        subject
    };
    sticker_prompt(subject, style, caption)
}

pub fn edit_prompt(instruction: &str) -> String {
    format!(
        "Edit this sticker: {}. Keep everything else about the sticker unchanged. {}",
        instruction.trim().trim_end_matches('.'),
        BLACK_BACKGROUND_CONTRACT
    )
}
