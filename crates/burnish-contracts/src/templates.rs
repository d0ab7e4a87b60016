use crate::attempts::Attempt;

/// Builds the critique request sent alongside a generated image.
///
/// The wording is a model-facing contract: downstream review quality depends
/// on it, so any change here is a behavioral change, not a cosmetic one.
pub fn review_prompt(original_prompt: &str) -> String {
    format!(
        "The image provided was generated from the following prompt:\n\
         {original_prompt}\n\
         \n\
         Evaluate how well the generated image adhered to the prompt and its overall aesthetic quality. Describe which elements of the prompt are present and missing from the image, then finally provide an overall score from 1 (worst) to 10 (best).\n"
    )
}

/// Builds the revision request from the run's intent and attempt transcript.
///
/// `previous_attempts` must exclude the current pair; the transcript appends
/// `(current_prompt, current_review)` as its final entry. Callers pass the
/// history as captured before recording the current attempt.
pub fn revision_prompt(
    original_prompt: &str,
    current_prompt: &str,
    current_review: &str,
    previous_attempts: &[Attempt],
) -> String {
    let transcript = attempt_transcript(previous_attempts, current_prompt, current_review);
    format!(
        "We need to create a prompt for image generation that reflects the following intent:\n\
         {original_prompt}\n\
         \n\
         Here are the previous prompt attempts, and how well each performed:\n\
         {transcript}\n\
         \n\
         Write a new prompt to generate an image that captures all the elements of the original intent better than any of the previous attempts. Be creative; do not repeat any existing prompt. Output only the new prompt, with no intro or surrounding quotes.\n"
    )
}

fn transcript_entry(index: usize, prompt: &str, review: &str) -> String {
    format!("Prompt #{index}: {prompt}\nPrompt #{index} review: {review}")
}

fn attempt_transcript(
    previous_attempts: &[Attempt],
    current_prompt: &str,
    current_review: &str,
) -> String {
    let mut transcript = String::new();
    for (position, attempt) in previous_attempts.iter().enumerate() {
        transcript.push_str(&transcript_entry(
            position + 1,
            &attempt.prompt,
            &attempt.review,
        ));
        transcript.push_str("\n\n");
    }
    transcript.push_str(&transcript_entry(
        previous_attempts.len() + 1,
        current_prompt,
        current_review,
    ));
    transcript
}
